//! Shared fixtures for this crate's tests

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use checkout_core::wire::{CartLineRequest, InitiateCheckoutRequest};
use checkout_core::{ContactInfo, MemoryCommerceStore, MemoryDraftStore, RecurringInterval, ShippingAddress, UserProfile};
use secrecy::SecretString;
use serde_json::json;

use crate::initiator::TransactionInitiator;
use crate::processor::{CanonicalPrice, MockProcessor};
use crate::reconciler::WebhookReconciler;
use crate::webhook::WebhookVerifier;

pub(crate) const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub(crate) struct Harness {
    pub processor: Arc<MockProcessor>,
    pub drafts: Arc<MemoryDraftStore>,
    pub store: MemoryCommerceStore,
    pub initiator: TransactionInitiator,
    pub reconciler: Arc<WebhookReconciler>,
    pub verifier: WebhookVerifier,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_reconciler(|r| r)
    }

    pub fn with_reconciler(configure: impl FnOnce(WebhookReconciler) -> WebhookReconciler) -> Self {
        let processor = Arc::new(
            MockProcessor::new()
                .with_price(CanonicalPrice::one_time("price_tea", 599))
                .with_price(CanonicalPrice::one_time("price_mug", 1500))
                .with_price(CanonicalPrice::recurring("price_box", 999, RecurringInterval::Month))
                .with_price(CanonicalPrice::recurring("price_beans", 1299, RecurringInterval::Week)),
        );
        let drafts = Arc::new(MemoryDraftStore::new());
        let store = MemoryCommerceStore::new();
        let verifier = WebhookVerifier::new(SecretString::from(WEBHOOK_SECRET));

        let initiator = TransactionInitiator::new(processor.clone(), drafts.clone(), Arc::new(store.clone()));
        let reconciler = configure(WebhookReconciler::new(
            verifier.clone(),
            drafts.clone(),
            Arc::new(store.clone()),
            processor.clone(),
        ));

        Self {
            processor,
            drafts,
            store,
            initiator,
            reconciler: Arc::new(reconciler),
            verifier,
        }
    }

    pub fn user(&self) -> UserProfile {
        let mut user = UserProfile::new("grace@example.com");
        user.phone = Some("555-0199".into());
        self.store.insert_user(user.clone()).unwrap();
        user
    }

    /// Signature header for `body`, signed now
    pub fn sign(&self, body: &[u8]) -> String {
        self.verifier.sign(body, Utc::now().timestamp()).unwrap()
    }

    /// Metadata the processor recorded for the most recent transaction
    pub fn last_metadata(&self) -> HashMap<String, String> {
        self.processor
            .opened_transactions()
            .last()
            .map(|t| t.metadata.to_map())
            .unwrap_or_default()
    }
}

pub(crate) fn line(price_id: &str, quantity: u32) -> CartLineRequest {
    CartLineRequest {
        product_id: format!("prod_{}", price_id.trim_start_matches("price_")),
        price_id: price_id.into(),
        name: price_id.trim_start_matches("price_").into(),
        quantity,
        unit_price: None,
        recurring: matches!(price_id, "price_box" | "price_beans"),
        interval: None,
    }
}

pub(crate) fn checkout(lines: Vec<CartLineRequest>) -> InitiateCheckoutRequest {
    InitiateCheckoutRequest {
        lines,
        contact: ContactInfo {
            email: "grace@example.com".into(),
            phone: Some("555-0199".into()),
        },
        shipping: ShippingAddress {
            name: "Grace Hopper".into(),
            line1: "1 Compiler Court".into(),
            line2: Some("Apt 2".into()),
            city: "Arlington".into(),
            state: "VA".into(),
            postal_code: "22201".into(),
            country: "US".into(),
        },
        notes: None,
        saved_payment_method_id: None,
        save_payment_method: false,
    }
}

pub(crate) fn event_body(event_id: &str, event_type: &str, object: serde_json::Value) -> Vec<u8> {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "data": {"object": object}
    })
    .to_string()
    .into_bytes()
}

pub(crate) fn payment_succeeded(metadata: &HashMap<String, String>) -> Vec<u8> {
    event_body(
        "evt_pi",
        "payment_intent.succeeded",
        json!({
            "id": "pi_test",
            "object": "payment_intent",
            "status": "succeeded",
            "metadata": metadata,
            "payment_method": "pm_card_visa"
        }),
    )
}

pub(crate) fn setup_succeeded(metadata: &HashMap<String, String>) -> Vec<u8> {
    event_body(
        "evt_seti",
        "setup_intent.succeeded",
        json!({
            "id": "seti_test",
            "object": "setup_intent",
            "status": "succeeded",
            "metadata": metadata,
            "payment_method": "pm_card_visa"
        }),
    )
}
