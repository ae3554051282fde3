//! Stripe.js bindings
//!
//! Only what checkout needs: mount the Payment Element for a client secret
//! and confirm it. Stripe.js itself is loaded by `index.html`.

use checkout_core::wire::TransactionKind;
use js_sys::{Object, Promise, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

#[wasm_bindgen]
extern "C" {
    /// `Stripe(publishableKey)` instance
    #[derive(Clone)]
    pub type StripeJs;

    #[wasm_bindgen(js_name = Stripe)]
    fn stripe_js(publishable_key: &str) -> StripeJs;

    #[wasm_bindgen(method)]
    fn elements(this: &StripeJs, options: &JsValue) -> Elements;

    #[wasm_bindgen(method, js_name = confirmPayment)]
    fn confirm_payment(this: &StripeJs, options: &JsValue) -> Promise;

    #[wasm_bindgen(method, js_name = confirmSetup)]
    fn confirm_setup(this: &StripeJs, options: &JsValue) -> Promise;

    #[derive(Clone)]
    pub type Elements;

    #[wasm_bindgen(method)]
    fn create(this: &Elements, kind: &str) -> PaymentElement;

    pub type PaymentElement;

    #[wasm_bindgen(method)]
    fn mount(this: &PaymentElement, selector: &str);
}

fn object(entries: &[(&str, &JsValue)]) -> Result<JsValue, JsValue> {
    let obj = Object::new();
    for (key, value) in entries {
        Reflect::set(&obj, &JsValue::from_str(key), value)?;
    }
    Ok(obj.into())
}

/// A Payment Element mounted for one transaction
#[derive(Clone)]
pub struct MountedPayment {
    stripe: StripeJs,
    elements: Elements,
    kind: TransactionKind,
}

impl MountedPayment {
    /// Mount the Payment Element into `selector`
    pub fn mount(
        publishable_key: &str,
        client_secret: &str,
        kind: TransactionKind,
        selector: &str,
    ) -> Result<Self, JsValue> {
        let stripe = stripe_js(publishable_key);
        let options = object(&[("clientSecret", &JsValue::from_str(client_secret))])?;
        let elements = stripe.elements(&options);
        elements.create("payment").mount(selector);

        Ok(Self { stripe, elements, kind })
    }

    /// Confirm the transaction. Success navigates to `return_url` (possibly
    /// via an issuer challenge); `Err` carries Stripe's message for an
    /// in-place failure such as a declined card.
    pub async fn confirm(&self, return_url: &str) -> Result<(), String> {
        let confirm_params = object(&[("return_url", &JsValue::from_str(return_url))])
            .map_err(|_| "Could not start payment confirmation".to_string())?;
        let options = object(&[("elements", self.elements.as_ref()), ("confirmParams", &confirm_params)])
            .map_err(|_| "Could not start payment confirmation".to_string())?;

        let promise = match self.kind {
            TransactionKind::Payment => self.stripe.confirm_payment(&options),
            TransactionKind::Setup => self.stripe.confirm_setup(&options),
        };

        let result = JsFuture::from(promise)
            .await
            .map_err(|_| "Payment could not be confirmed. Please try again.".to_string())?;

        // Stripe only resolves (instead of redirecting) when something went wrong
        let error = Reflect::get(&result, &JsValue::from_str("error")).unwrap_or(JsValue::UNDEFINED);
        if error.is_undefined() || error.is_null() {
            return Ok(());
        }
        let message = Reflect::get(&error, &JsValue::from_str("message"))
            .ok()
            .and_then(|m| m.as_string())
            .unwrap_or_else(|| "Your payment was declined.".into());
        Err(message)
    }
}
