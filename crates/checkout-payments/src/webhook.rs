//! Stripe Webhook Handling
//!
//! Signature verification over the raw request body and parsing of the
//! event types checkout reacts to.
//!
//! Events are decoded from JSON directly rather than through typed SDK
//! objects, so fields the API adds later and event types this service does
//! not know about never fail deserialization.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use checkout_core::wire::TransactionKind;
use checkout_core::{Money, SubscriptionStatus};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{CheckoutError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verifies `Stripe-Signature: t=<unix>,v1=<hex>` headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verify against the current time
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| CheckoutError::SignatureVerification("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(CheckoutError::SignatureVerification("missing v1 signature".into()));
        }

        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(CheckoutError::SignatureVerification(
                "timestamp outside tolerance".into(),
            ));
        }

        for signature in signatures {
            let Ok(expected) = hex::decode(signature) else {
                continue;
            };
            let mut mac = self.mac(timestamp)?;
            mac.update(payload);
            if mac.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }

        Err(CheckoutError::SignatureVerification("no matching signature".into()))
    }

    /// Produce a header value for `payload` (local tooling and tests)
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let mut mac = self.mac(timestamp)?;
        mac.update(payload);
        Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
    }

    /// MAC primed with the `{t}.` prefix of the signed payload
    fn mac(&self, timestamp: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| CheckoutError::Config(format!("webhook secret: {e}")))?;
        mac.update(format!("{timestamp}.").as_bytes());
        Ok(mac)
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

/// Event envelope
#[derive(Clone, Debug, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub data: EventData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// A transaction that completed successfully
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SucceededTransaction {
    pub id: String,
    pub kind: TransactionKind,
    pub metadata: HashMap<String, String>,
    pub customer_id: Option<String>,

    /// Payment method confirmed by the shopper
    pub payment_method_id: Option<String>,
}

/// Processor-side subscription state carried by lifecycle events
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub external_id: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub collection_paused: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceLineSnapshot {
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub description: Option<String>,
    pub quantity: u32,
    pub amount: Money,
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceSnapshot {
    pub id: String,
    pub subscription_id: Option<String>,
    pub billing_reason: Option<String>,
    pub amount_paid: Money,
    pub currency: String,
    pub payment_intent_id: Option<String>,
    pub lines: Vec<InvoiceLineSnapshot>,
}

impl InvoiceSnapshot {
    /// First invoice of a subscription created at checkout
    pub fn is_subscription_create(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }

    /// Latest period end across lines
    pub fn period_end(&self) -> Option<DateTime<Utc>> {
        self.lines.iter().filter_map(|l| l.period_end).max()
    }
}

/// Parsed webhook event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckoutEvent {
    /// `payment_intent.succeeded` / `setup_intent.succeeded`
    TransactionSucceeded(SucceededTransaction),

    /// `customer.subscription.updated|deleted|paused|resumed`
    SubscriptionChanged(SubscriptionSnapshot),

    /// `invoice.paid`
    InvoicePaid(InvoiceSnapshot),

    /// `invoice.payment_failed`
    InvoicePaymentFailed(InvoiceSnapshot),

    /// Unhandled event type
    Other { event_type: String },
}

impl CheckoutEvent {
    /// Parse a verified event into the variants checkout handles
    pub fn parse(event: &ProcessorEvent) -> serde_json::Result<Self> {
        let object = event.data.object.clone();
        let parsed = match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: RawIntent = serde_json::from_value(object)?;
                CheckoutEvent::TransactionSucceeded(intent.into_succeeded(TransactionKind::Payment))
            }
            "setup_intent.succeeded" => {
                let intent: RawIntent = serde_json::from_value(object)?;
                CheckoutEvent::TransactionSucceeded(intent.into_succeeded(TransactionKind::Setup))
            }
            "customer.subscription.updated"
            | "customer.subscription.deleted"
            | "customer.subscription.paused"
            | "customer.subscription.resumed" => {
                CheckoutEvent::SubscriptionChanged(serde_json::from_value::<RawSubscription>(object)?.into())
            }
            "invoice.paid" => CheckoutEvent::InvoicePaid(serde_json::from_value::<RawInvoice>(object)?.into()),
            "invoice.payment_failed" => {
                CheckoutEvent::InvoicePaymentFailed(serde_json::from_value::<RawInvoice>(object)?.into())
            }
            other => CheckoutEvent::Other {
                event_type: other.to_string(),
            },
        };
        Ok(parsed)
    }
}

/// A reference that may arrive as a bare id or an expanded object
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

#[derive(Deserialize)]
struct RawIntent {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    customer: Option<Expandable>,
    #[serde(default)]
    payment_method: Option<Expandable>,
}

impl RawIntent {
    fn into_succeeded(self, kind: TransactionKind) -> SucceededTransaction {
        SucceededTransaction {
            id: self.id,
            kind,
            metadata: self.metadata,
            customer_id: self.customer.map(Expandable::into_id),
            payment_method_id: self.payment_method.map(Expandable::into_id),
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    pause_collection: Option<serde_json::Value>,
    #[serde(default)]
    items: Option<RawList<RawSubscriptionItem>>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl From<RawSubscription> for SubscriptionSnapshot {
    fn from(raw: RawSubscription) -> Self {
        // Newer API versions report the period on each item
        let item_period_end = raw
            .items
            .and_then(|items| items.data.into_iter().filter_map(|i| i.current_period_end).max());

        SubscriptionSnapshot {
            external_id: raw.id,
            status: SubscriptionStatus::parse(&raw.status),
            cancel_at_period_end: raw.cancel_at_period_end,
            current_period_end: timestamp(raw.current_period_end.or(item_period_end)),
            collection_paused: raw.pause_collection.is_some_and(|p| !p.is_null()),
        }
    }
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    #[serde(default)]
    subscription: Option<Expandable>,
    #[serde(default)]
    parent: Option<RawInvoiceParent>,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    payment_intent: Option<Expandable>,
    #[serde(default)]
    lines: Option<RawList<RawInvoiceLine>>,
}

#[derive(Deserialize)]
struct RawInvoiceParent {
    #[serde(default)]
    subscription_details: Option<RawSubscriptionDetails>,
}

#[derive(Deserialize)]
struct RawSubscriptionDetails {
    subscription: Expandable,
}

#[derive(Deserialize)]
struct RawInvoiceLine {
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    price: Option<RawPrice>,
    #[serde(default)]
    period: Option<RawPeriod>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
    #[serde(default)]
    product: Option<Expandable>,
}

#[derive(Deserialize)]
struct RawPeriod {
    #[serde(default)]
    end: Option<i64>,
}

impl From<RawInvoice> for InvoiceSnapshot {
    fn from(raw: RawInvoice) -> Self {
        let subscription_id = raw.subscription.map(Expandable::into_id).or_else(|| {
            raw.parent
                .and_then(|p| p.subscription_details)
                .map(|d| d.subscription.into_id())
        });

        let lines = raw
            .lines
            .map(|list| list.data)
            .unwrap_or_default()
            .into_iter()
            .map(|line| {
                let (price_id, product_id) = match line.price {
                    Some(price) => (Some(price.id), price.product.map(Expandable::into_id)),
                    None => (None, None),
                };
                InvoiceLineSnapshot {
                    price_id,
                    product_id,
                    description: line.description,
                    quantity: line.quantity.unwrap_or(1),
                    amount: Money::from_cents(line.amount),
                    period_end: timestamp(line.period.and_then(|p| p.end)),
                }
            })
            .collect();

        InvoiceSnapshot {
            id: raw.id,
            subscription_id,
            billing_reason: raw.billing_reason,
            amount_paid: Money::from_cents(raw.amount_paid),
            currency: raw.currency,
            payment_intent_id: raw.payment_intent.map(Expandable::into_id),
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SecretString::from("whsec_test"))
    }

    fn event(event_type: &str, object: serde_json::Value) -> ProcessorEvent {
        let body = json!({"id": "evt_1", "type": event_type, "data": {"object": object}});
        ProcessorEvent::from_slice(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_signature_round_trip() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, 1_700_000_000).unwrap();
        assert!(verifier().verify_at(payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let header = verifier().sign(b"{\"amount\":100}", 1_700_000_000).unwrap();
        let err = verifier()
            .verify_at(b"{\"amount\":1}", &header, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, CheckoutError::SignatureVerification(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let other = WebhookVerifier::new(SecretString::from("whsec_other"));
        let header = other.sign(b"{}", 1_700_000_000).unwrap();
        assert!(verifier().verify_at(b"{}", &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={t},v1=00");
            let err = verifier().verify_at(b"{}", &header, 1_700_000_000).unwrap_err();
            assert!(matches!(err, CheckoutError::SignatureVerification(ref m) if m.contains("tolerance")));
        }
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = verifier().sign(b"{}", 1_700_000_000).unwrap();
        assert!(verifier().verify_at(b"{}", &header, 1_700_000_301).is_err());
        assert!(
            verifier()
                .with_tolerance(Duration::from_secs(600))
                .verify_at(b"{}", &header, 1_700_000_301)
                .is_ok()
        );
    }

    #[test]
    fn test_malformed_headers_rejected() {
        for header in ["", "t=abc,v1=00", "v1=deadbeef", "t=1700000000"] {
            assert!(verifier().verify_at(b"{}", header, 1_700_000_000).is_err(), "{header}");
        }
    }

    #[test]
    fn test_any_v1_may_match() {
        let valid = verifier().sign(b"{}", 1_700_000_000).unwrap();
        let v1 = valid.split_once(",v1=").unwrap().1;
        let header = format!("t=1700000000,v1=zz,v1={}", "0".repeat(64));
        assert!(verifier().verify_at(b"{}", &header, 1_700_000_000).is_err());
        let header = format!("t=1700000000,v1={},v1={v1}", "0".repeat(64));
        assert!(verifier().verify_at(b"{}", &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_parse_payment_intent() {
        let parsed = CheckoutEvent::parse(&event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_1",
                "object": "payment_intent",
                "metadata": {"checkout_schema": "1"},
                "customer": null,
                "payment_method": {"id": "pm_1", "object": "payment_method"},
                "amount": 1198
            }),
        ))
        .unwrap();

        let CheckoutEvent::TransactionSucceeded(tx) = parsed else {
            panic!("expected transaction event");
        };
        assert_eq!(tx.kind, TransactionKind::Payment);
        assert_eq!(tx.payment_method_id.as_deref(), Some("pm_1"));
        assert_eq!(tx.metadata.get("checkout_schema").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_parse_subscription_with_item_periods() {
        let parsed = CheckoutEvent::parse(&event(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "status": "past_due",
                "cancel_at_period_end": true,
                "pause_collection": null,
                "items": {"data": [{"current_period_end": 1_700_000_000}]}
            }),
        ))
        .unwrap();

        assert_eq!(
            parsed,
            CheckoutEvent::SubscriptionChanged(SubscriptionSnapshot {
                external_id: "sub_1".into(),
                status: SubscriptionStatus::PastDue,
                cancel_at_period_end: true,
                current_period_end: DateTime::from_timestamp(1_700_000_000, 0),
                collection_paused: false,
            })
        );
    }

    #[test]
    fn test_parse_invoice_with_parent_reference() {
        let parsed = CheckoutEvent::parse(&event(
            "invoice.paid",
            json!({
                "id": "in_1",
                "billing_reason": "subscription_cycle",
                "amount_paid": 999,
                "currency": "usd",
                "parent": {"subscription_details": {"subscription": "sub_1"}},
                "lines": {"data": [{
                    "amount": 999, "quantity": 1, "description": "Tea box",
                    "price": {"id": "price_box", "product": "prod_box"},
                    "period": {"end": 1_700_000_000}
                }]}
            }),
        ))
        .unwrap();

        let CheckoutEvent::InvoicePaid(invoice) = parsed else {
            panic!("expected invoice event");
        };
        assert_eq!(invoice.subscription_id.as_deref(), Some("sub_1"));
        assert!(!invoice.is_subscription_create());
        assert_eq!(invoice.amount_paid, Money::from_cents(999));
        assert_eq!(invoice.lines[0].product_id.as_deref(), Some("prod_box"));
        assert_eq!(invoice.period_end(), DateTime::from_timestamp(1_700_000_000, 0));
    }

    #[test]
    fn test_unknown_event_type() {
        let parsed = CheckoutEvent::parse(&event("charge.dispute.created", json!({"id": "dp_1"}))).unwrap();
        assert_eq!(
            parsed,
            CheckoutEvent::Other {
                event_type: "charge.dispute.created".into()
            }
        );
    }
}
