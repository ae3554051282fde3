//! UI Components

use checkout_core::wire::CartLineRequest;
use checkout_core::{CheckoutFlow, Step};
use leptos::prelude::*;

const STEPS: [(Step, &str); 4] = [
    (Step::AuthChoice, "Account"),
    (Step::Contact, "Contact"),
    (Step::Shipping, "Shipping"),
    (Step::Payment, "Payment"),
];

/// Step list; completed steps can be reopened
#[component]
pub fn StepNav(flow: RwSignal<CheckoutFlow>) -> impl IntoView {
    let items = STEPS
        .into_iter()
        .map(|(step, label)| {
            let class = move || {
                flow.with(|f| {
                    let mut class = String::from("step");
                    if f.step() == step {
                        class.push_str(" current");
                    }
                    if f.is_complete(step) {
                        class.push_str(" done");
                    }
                    class
                })
            };
            view! {
                <li class=class>
                    <button on:click=move |_| flow.update(|f| {
                        let _ = f.edit(step);
                    })>
                        {label}
                    </button>
                </li>
            }
        })
        .collect_view();

    view! { <ol class="steps">{items}</ol> }
}

/// Retryable message above the current step
#[component]
pub fn Banner(flow: RwSignal<CheckoutFlow>) -> impl IntoView {
    let message = move || flow.with(|f| f.banner().map(String::from));
    view! {
        <Show when=move || message().is_some()>
            <div class="banner" role="alert">{message}</div>
        </Show>
    }
}

/// Labelled text input with its validation message
#[component]
pub fn TextField(
    label: &'static str,
    field: &'static str,
    flow: RwSignal<CheckoutFlow>,
    #[prop(into)] value: Signal<String>,
    set: impl Fn(String) + Send + Sync + 'static,
    #[prop(default = "text")] kind: &'static str,
) -> impl IntoView {
    let error = move || flow.with(|f| f.field_errors().get(field).map(String::from));

    view! {
        <label class="field">
            <span>{label}</span>
            <input
                type=kind
                name=field
                prop:value=move || value.get()
                on:input=move |ev| set(event_target_value(&ev))
            />
            <Show when=move || error().is_some()>
                <span class="field-error">{error}</span>
            </Show>
        </label>
    }
}

#[component]
pub fn OrderSummary(lines: Vec<CartLineRequest>) -> impl IntoView {
    let rows = lines
        .into_iter()
        .map(|line| {
            let price = line
                .unit_price
                .map(|p| format!("${p}"))
                .unwrap_or_default();
            let cadence = match (line.recurring, line.interval) {
                (true, Some(interval)) => format!(" / {}", interval.as_str()),
                (true, None) => " (subscription)".to_string(),
                _ => String::new(),
            };
            view! {
                <li>
                    <span class="name">{line.name}</span>
                    <span class="qty">" × "{line.quantity}</span>
                    <span class="price">{price}{cadence}</span>
                </li>
            }
        })
        .collect_view();

    view! {
        <aside class="summary">
            <h2>"Order summary"</h2>
            <ul>{rows}</ul>
            <p class="note">"Prices are confirmed when payment opens."</p>
        </aside>
    }
}
