//! Checkout Page
//!
//! Renders whatever step [`CheckoutFlow`] is on and carries out the effects
//! it returns. The flow owns every decision; this module only wires DOM
//! events and network calls to it.

use checkout_core::flow::TransactionState;
use checkout_core::wire::TransactionKind;
use checkout_core::{
    AuthContext, CartContext, CheckoutFlow, ContactInfo, FlowEffect, FlowError, ShippingAddress, Step,
};
use leptos::ev::MouseEvent;
use leptos::prelude::*;

use crate::api::{self, CheckoutConfig};
use crate::components::{Banner, OrderSummary, StepNav, TextField};
use crate::storage::{self, SessionDraftKeySlot};
use crate::stripe::MountedPayment;

const PAYMENT_ELEMENT: &str = "#payment-element";

/// Call the initiate endpoint for an `Initiate` effect
fn run_effect(flow: RwSignal<CheckoutFlow>, token: StoredValue<Option<String>>, effect: FlowEffect) {
    let FlowEffect::Initiate { attempt, request } = effect else {
        return;
    };

    leptos::task::spawn_local(async move {
        let token = token.get_value();
        // Results of superseded attempts are dropped by the flow
        match api::initiate(&request, token.as_deref()).await {
            Ok(response) => flow.update(|f| {
                f.initiation_succeeded(attempt, response);
            }),
            Err(failure) => flow.update(|f| {
                f.initiation_failed(attempt, failure.message);
            }),
        }
    });
}

/// Apply a fallible flow transition and run its effect
fn submit(
    flow: RwSignal<CheckoutFlow>,
    token: StoredValue<Option<String>>,
    transition: impl FnOnce(&mut CheckoutFlow) -> Result<FlowEffect, FlowError>,
) {
    if let Some(Ok(effect)) = flow.try_update(transition) {
        run_effect(flow, token, effect);
    }
}

fn return_url() -> String {
    let origin = web_sys::window()
        .and_then(|w| w.location().origin().ok())
        .unwrap_or_default();
    format!("{origin}/checkout/complete")
}

#[component]
pub fn CheckoutPage() -> impl IntoView {
    let session = storage::load_session();
    let token = StoredValue::new(session.as_ref().map(|s| s.token.clone()));
    let auth = session.map_or_else(AuthContext::guest, |s| AuthContext::signed_in(s.profile));
    let signed_in = auth.is_authenticated();

    let cart = CartContext {
        lines: storage::load_cart(),
    };
    let lines = cart.lines.clone();
    let flow = RwSignal::new(CheckoutFlow::new(cart, &auth));

    // Form state, seeded from the flow (pre-filled for signed-in shoppers)
    let contact = RwSignal::new(flow.with_untracked(|f| f.contact().clone()));
    let shipping = RwSignal::new(flow.with_untracked(|f| f.shipping().clone()));
    let notes = RwSignal::new(String::new());
    let save_card = RwSignal::new(false);
    let confirming = RwSignal::new(false);

    let publishable_key = RwSignal::new(None::<String>);
    let config_error = RwSignal::new(None::<String>);
    let currency = RwSignal::new(String::from("usd"));
    leptos::task::spawn_local(async move {
        match api::checkout_config().await {
            Ok(CheckoutConfig {
                publishable_key: Some(key),
                currency: code,
            }) => {
                publishable_key.set(Some(key));
                currency.set(code);
            }
            Ok(_) => config_error.set(Some("Card payments are unavailable right now.".into())),
            Err(failure) => config_error.set(Some(failure.message)),
        }
    });

    // Mount the Payment Element once per client secret
    let mounted = StoredValue::new_local(None::<(String, MountedPayment)>);
    Effect::new(move |_| {
        let ready = flow.with(|f| match (f.step(), f.transaction()) {
            (Step::Payment, TransactionState::Ready(r)) => Some((r.client_secret.clone(), r.kind)),
            _ => None,
        });
        let (Some((secret, kind)), Some(key)) = (ready, publishable_key.get()) else {
            return;
        };
        if mounted.with_value(|m| m.as_ref().is_some_and(|(s, _)| *s == secret)) {
            return;
        }
        match MountedPayment::mount(&key, &secret, kind, PAYMENT_ELEMENT) {
            Ok(payment) => mounted.set_value(Some((secret, payment))),
            Err(_) => flow.update(|f| f.confirmation_failed("Payment form failed to load. Please refresh.")),
        }
    });

    let confirm = move |_: MouseEvent| {
        if confirming.get_untracked() {
            return;
        }
        let Some(Ok(handoff)) = flow.try_update(|f| f.begin_confirmation(&mut SessionDraftKeySlot)) else {
            return;
        };
        let Some(payment) = mounted.with_value(|m| {
            m.as_ref()
                .filter(|(s, _)| *s == handoff.client_secret)
                .map(|(_, p)| p.clone())
        }) else {
            return;
        };

        confirming.set(true);
        leptos::task::spawn_local(async move {
            // Success navigates away; only in-place failures come back
            if let Err(message) = payment.confirm(&return_url()).await {
                flow.update(|f| f.confirmation_failed(message));
            }
            confirming.set(false);
        });
    };

    let step_view = move || match flow.with(|f| f.step()) {
        Step::AuthChoice => view! {
            <section class="auth-choice">
                <h2>"How would you like to check out?"</h2>
                <a class="btn btn-primary" href="/login?next=/checkout">"Log in"</a>
                <button class="btn" on:click=move |_| flow.update(|f| {
                    let _ = f.continue_as_guest();
                })>
                    "Continue as guest"
                </button>
            </section>
        }
        .into_any(),

        Step::Contact => view! {
            <section class="contact">
                <h2>"Contact"</h2>
                <TextField
                    label="Email" field="email" kind="email" flow=flow
                    value=Signal::derive(move || contact.with(|c| c.email.clone()))
                    set=move |v| contact.update(|c| c.email = v)
                />
                <TextField
                    label="Phone" field="phone" kind="tel" flow=flow
                    value=Signal::derive(move || contact.with(|c| c.phone.clone().unwrap_or_default()))
                    set=move |v| contact.update(|c| c.phone = Some(v).filter(|p: &String| !p.is_empty()))
                />
                <button class="btn btn-primary" on:click=move |_| {
                    let details: ContactInfo = contact.get_untracked();
                    submit(flow, token, |f| f.submit_contact(details));
                }>
                    "Continue to shipping"
                </button>
            </section>
        }
        .into_any(),

        Step::Shipping => view! {
            <section class="shipping">
                <h2>"Shipping address"</h2>
                <TextField
                    label="Full name" field="name" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.name.clone()))
                    set=move |v| shipping.update(|s| s.name = v)
                />
                <TextField
                    label="Address" field="line1" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.line1.clone()))
                    set=move |v| shipping.update(|s| s.line1 = v)
                />
                <TextField
                    label="Apartment, suite (optional)" field="line2" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.line2.clone().unwrap_or_default()))
                    set=move |v| shipping.update(|s| s.line2 = Some(v).filter(|l: &String| !l.is_empty()))
                />
                <TextField
                    label="City" field="city" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.city.clone()))
                    set=move |v| shipping.update(|s| s.city = v)
                />
                <TextField
                    label="State" field="state" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.state.clone()))
                    set=move |v| shipping.update(|s| s.state = v)
                />
                <TextField
                    label="Postal code" field="postal_code" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.postal_code.clone()))
                    set=move |v| shipping.update(|s| s.postal_code = v)
                />
                <TextField
                    label="Country" field="country" flow=flow
                    value=Signal::derive(move || shipping.with(|s| s.country.clone()))
                    set=move |v| shipping.update(|s| s.country = v)
                />
                <label class="field">
                    <span>"Delivery notes (optional)"</span>
                    <textarea
                        prop:value=move || notes.get()
                        on:input=move |ev| notes.set(event_target_value(&ev))
                    />
                </label>
                <button class="btn btn-primary" on:click=move |_| {
                    let address: ShippingAddress = shipping.get_untracked();
                    let note = Some(notes.get_untracked()).filter(|n| !n.trim().is_empty());
                    submit(flow, token, |f| f.submit_shipping(address, note));
                }>
                    "Continue to payment"
                </button>
            </section>
        }
        .into_any(),

        Step::Payment => view! {
            <section class="payment">
                <h2>"Payment"</h2>
                <Show when=move || signed_in>
                    <label class="checkbox">
                        <input
                            type="checkbox"
                            prop:checked=move || save_card.get()
                            on:change=move |ev| {
                                let save = event_target_checked(&ev);
                                save_card.set(save);
                                let effect = flow.try_update(|f| f.set_payment_choice(None, save));
                                if let Some(effect) = effect {
                                    run_effect(flow, token, effect);
                                }
                            }
                        />
                        "Save this card for next time"
                    </label>
                </Show>
                {move || match flow.with(|f| f.transaction().clone()) {
                    TransactionState::Ready(ready) => {
                        let label = match ready.kind {
                            TransactionKind::Payment => {
                                format!("Pay {} {}", ready.amount, currency.get_untracked().to_uppercase())
                            }
                            TransactionKind::Setup => "Start subscription".to_string(),
                        };
                        view! {
                            <Show when=move || config_error.with(Option::is_some)>
                                <p class="banner" role="alert">{move || config_error.get()}</p>
                            </Show>
                            <div id="payment-element"></div>
                            <button
                                class="btn btn-primary"
                                disabled=move || confirming.get()
                                on:click=confirm
                            >
                                {move || if confirming.get() { "Processing...".to_string() } else { label.clone() }}
                            </button>
                        }
                        .into_any()
                    }
                    TransactionState::Initiating(_) => view! {
                        <p class="loading">"Preparing secure payment..."</p>
                    }
                    .into_any(),
                    TransactionState::NotStarted => view! {
                        <button class="btn" on:click=move |_| submit(flow, token, |f| f.retry_initiation())>
                            "Try again"
                        </button>
                    }
                    .into_any(),
                }}
            </section>
        }
        .into_any(),
    };

    view! {
        <div class="checkout">
            <StepNav flow=flow />
            <Banner flow=flow />
            <Show
                when=move || !lines.is_empty()
                fallback=|| view! { <p class="empty">"Your cart is empty."</p> }
            >
                <main class="checkout-step">{step_view}</main>
            </Show>
            <OrderSummary lines=storage::load_cart() />
        </div>
    }
}
