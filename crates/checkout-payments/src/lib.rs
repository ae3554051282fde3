//! # checkout-payments
//!
//! Payment processing for the storefront checkout: opening processor
//! transactions, verifying webhook deliveries and turning confirmed payments
//! into orders and subscriptions exactly once.
//!
//! ## Flow
//!
//! The payment form is embedded in the checkout page (Stripe Elements), so the
//! browser confirms the transaction itself and may be sent away for card
//! authentication. Nothing is written to the order tables until the processor
//! tells us, out of band, that the money moved.
//!
//! ```text
//! ┌──────────┐  initiate   ┌─────────────────────┐  open   ┌───────────┐
//! │ Browser  │────────────▶│ TransactionInitiator│────────▶│  Stripe   │
//! │          │◀────────────│  (draft + reprice)  │◀────────│           │
//! └────┬─────┘ client      └─────────────────────┘ secret  └─────┬─────┘
//!      │ secret                                                   │
//!      │ confirm (3DS, redirect...)                               │ webhook
//!      └─────────────────────────────────────────────────────────▶│
//!                                                                 ▼
//!                          ┌─────────────────────┐        ┌──────────────┐
//!                          │    Materializer     │◀───────│  Reconciler  │
//!                          │ order + subs, 1 tx  │        │ verify, route│
//!                          └─────────────────────┘        └──────────────┘
//! ```
//!
//! The draft key travels in the transaction metadata and is the idempotency
//! key for the whole checkout: the order row is unique on it, so concurrent or
//! repeated deliveries produce exactly one order.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use checkout_payments::{StripeProcessor, TransactionInitiator, WebhookReconciler, WebhookVerifier};
//!
//! let processor = Arc::new(StripeProcessor::new(&secret_key));
//! let initiator = TransactionInitiator::new(processor.clone(), drafts.clone(), store.clone());
//!
//! let response = initiator.initiate(user.as_ref(), request).await?;
//! // Hand response.client_secret to Stripe.js
//!
//! let reconciler = WebhookReconciler::new(WebhookVerifier::new(webhook_secret), drafts, store, processor);
//! let outcome = reconciler.handle(&body, signature).await?;
//! ```

mod error;
mod initiator;
mod materializer;
mod metadata;
mod processor;
mod reconciler;
mod subscriptions;
mod webhook;

#[cfg(test)]
mod testing;

pub use error::{CheckoutError, Result};
pub use initiator::{DEFAULT_CALL_TIMEOUT, TransactionInitiator};
pub use materializer::{DEFAULT_SUBSCRIPTION_TIMEOUT, Materialized, Materializer, RenewalRecorded};
pub use metadata::{CheckoutMetadata, MetadataError, SCHEMA_VERSION};
pub use processor::{
    CanonicalPrice, ExternalSubscription, MockProcessor, NewExternalSubscription, OpenTransaction,
    OpenedTransaction, PaymentProcessor, StripeProcessor,
};
pub use reconciler::{DEFAULT_DRAFT_TIMEOUT, ReconcileOutcome, WebhookReconciler};
pub use subscriptions::{SubscriptionAction, SubscriptionManager};
pub use webhook::{
    CheckoutEvent, DEFAULT_TOLERANCE, InvoiceSnapshot, ProcessorEvent, SIGNATURE_HEADER, SubscriptionSnapshot,
    SucceededTransaction, WebhookVerifier,
};
