//! Return page after payment confirmation
//!
//! The processor redirects here with `redirect_status` in the query. The
//! order itself is written by the webhook, so this page only shows it once
//! the server can find it by draft key.

use checkout_core::{DraftKeySlot, Order};
use leptos::prelude::*;
use web_sys::UrlSearchParams;

use crate::api;
use crate::storage::{self, SessionDraftKeySlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Confirming,
    Failed,
    Unknown,
}

fn redirect_status() -> Option<String> {
    let search = web_sys::window()?.location().search().ok()?;
    UrlSearchParams::new_with_str(&search).ok()?.get("redirect_status")
}

fn outcome(status: Option<&str>, has_draft: bool) -> Outcome {
    match status {
        Some("succeeded" | "processing") if has_draft => Outcome::Confirming,
        Some("failed" | "requires_payment_method") => Outcome::Failed,
        _ => Outcome::Unknown,
    }
}

#[component]
pub fn CompletePage() -> impl IntoView {
    let mut slot = SessionDraftKeySlot;
    let draft = slot.load();
    let outcome = outcome(redirect_status().as_deref(), draft.is_some());

    // A failed attempt keeps the key so the shopper can retry from checkout
    let placed = RwSignal::new(None::<Order>);
    if let (Outcome::Confirming, Some(key)) = (outcome, draft) {
        slot.clear();
        let token = storage::load_session().map(|s| s.token);
        leptos::task::spawn_local(async move {
            // Not found yet or unreachable both leave the confirming message up
            if let Ok(Some(order)) = api::order_for_draft(&key, token.as_deref()).await {
                placed.set(Some(order));
            }
        });
    }

    match outcome {
        Outcome::Confirming => view! {
            <div class="complete">
                <h1>"Thank you!"</h1>
                {move || match placed.get() {
                    Some(order) => view! {
                        <p>{format!("Order {} is placed. A receipt is on its way to {}.", order.id, order.email)}</p>
                    }
                    .into_any(),
                    None => view! {
                        <p>"We're confirming your payment. You'll get an email as soon as your order is placed."</p>
                    }
                    .into_any(),
                }}
                <a href="/" class="btn">"Continue shopping"</a>
            </div>
        }
        .into_any(),
        Outcome::Failed => view! {
            <div class="complete failed">
                <h1>"Payment not completed"</h1>
                <p>"Your payment didn't go through and you haven't been charged."</p>
                <a href="/checkout" class="btn btn-primary">"Back to checkout"</a>
            </div>
        }
        .into_any(),
        Outcome::Unknown => view! {
            <div class="complete">
                <h1>"Nothing to confirm"</h1>
                <p>"We couldn't find a checkout in progress for this tab."</p>
                <a href="/checkout" class="btn">"Go to checkout"</a>
            </div>
        }
        .into_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_needs_a_draft() {
        assert_eq!(outcome(Some("succeeded"), true), Outcome::Confirming);
        assert_eq!(outcome(Some("processing"), true), Outcome::Confirming);
        assert_eq!(outcome(Some("succeeded"), false), Outcome::Unknown);
    }

    #[test]
    fn test_failed_redirect() {
        assert_eq!(outcome(Some("failed"), true), Outcome::Failed);
        assert_eq!(outcome(Some("requires_payment_method"), false), Outcome::Failed);
        assert_eq!(outcome(None, true), Outcome::Unknown);
    }
}
