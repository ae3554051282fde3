//! Payment Processor Integration
//!
//! The outbound seam to the payment processor: canonical prices, billing
//! identities, payment/setup transactions and subscriptions.

mod live;
mod mock;

pub use live::StripeProcessor;
pub use mock::MockProcessor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use checkout_core::wire::TransactionKind;
use checkout_core::{Money, RecurringInterval, SubscriptionStatus, SubscriptionUpdate, UserId};

use crate::error::Result;
use crate::metadata::CheckoutMetadata;

/// A processor price record, the only trusted source of amounts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalPrice {
    pub id: String,
    pub product_id: String,
    pub unit_amount: Money,
    pub currency: String,
    pub active: bool,

    /// Set for recurring prices
    pub interval: Option<RecurringInterval>,
}

impl CanonicalPrice {
    pub fn one_time(id: &str, cents: i64) -> Self {
        Self {
            id: id.to_string(),
            product_id: format!("prod_{}", id.trim_start_matches("price_")),
            unit_amount: Money::from_cents(cents),
            currency: "usd".into(),
            active: true,
            interval: None,
        }
    }

    pub fn recurring(id: &str, cents: i64, interval: RecurringInterval) -> Self {
        Self {
            interval: Some(interval),
            ..Self::one_time(id, cents)
        }
    }
}

/// Parameters for opening a payment or setup transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenTransaction {
    pub kind: TransactionKind,

    /// Charged amount; zero for setup transactions
    pub amount: Money,
    pub currency: String,
    pub customer_id: Option<String>,

    /// Retain the payment method for off-session charges
    pub off_session: bool,

    /// Pay with a payment method already on file
    pub payment_method_id: Option<String>,
    pub receipt_email: Option<String>,
    pub metadata: CheckoutMetadata,
}

/// An opened transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedTransaction {
    pub id: String,
    pub client_secret: String,
}

/// Parameters for creating a processor subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewExternalSubscription {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: u32,
    pub payment_method_id: Option<String>,

    /// Repeating a request with the same key returns the same subscription
    pub idempotency_key: String,
}

/// Processor-side subscription state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub collection_paused: bool,
}

impl ExternalSubscription {
    /// Absolute update mirroring this state onto the local row
    pub fn to_update(&self) -> SubscriptionUpdate {
        SubscriptionUpdate {
            status: Some(self.status),
            cancel_at_period_end: Some(self.cancel_at_period_end),
            current_period_end: self.current_period_end,
            collection_paused: Some(self.collection_paused),
        }
    }
}

/// Payment processor trait (Strategy pattern)
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Look up a price. `None` when the processor has no such price.
    async fn price(&self, price_id: &str) -> Result<Option<CanonicalPrice>>;

    /// Find a billing identity by email
    async fn find_customer(&self, email: &str) -> Result<Option<String>>;

    /// Create a billing identity
    async fn create_customer(&self, email: &str, name: Option<&str>, user_id: UserId) -> Result<String>;

    /// Open a payment or setup transaction
    async fn open_transaction(&self, request: &OpenTransaction) -> Result<OpenedTransaction>;

    async fn create_subscription(&self, request: &NewExternalSubscription) -> Result<ExternalSubscription>;

    /// Cancel at the end of the current period
    async fn cancel_subscription(&self, external_id: &str) -> Result<ExternalSubscription>;

    /// Stop collecting payments without cancelling
    async fn pause_subscription(&self, external_id: &str) -> Result<ExternalSubscription>;

    /// Undo a pause or a scheduled cancellation
    async fn resume_subscription(&self, external_id: &str) -> Result<ExternalSubscription>;

    /// Charge future invoices for `customer_id` to `payment_method_id`
    async fn set_default_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()>;

    /// Processor name
    fn name(&self) -> &str;
}
