//! Webhook Reconciler
//!
//! Receives processor events, verifies them and keeps local state in step:
//!
//! ```text
//! signature ─▶ parse ─┬─ payment/setup succeeded ─▶ draft ─▶ materialize ─▶ delete draft
//!                     ├─ subscription changed    ─▶ status-set update
//!                     ├─ invoice paid            ─▶ period update + renewal order
//!                     ├─ invoice payment failed  ─▶ past_due
//!                     └─ anything else           ─▶ ignored
//! ```
//!
//! Delivery is at-least-once and may be concurrent. Every handler is safe to
//! repeat: order inserts are guarded by unique keys and subscription updates
//! write absolute values.

use std::sync::Arc;
use std::time::Duration;

use checkout_core::{CheckoutContext, CommerceStore, DraftStore, SubscriptionStatus, SubscriptionUpdate};
use serde::Serialize;

use crate::error::{CheckoutError, Result, within};
use crate::materializer::{Materialized, Materializer, RenewalRecorded};
use crate::metadata::{CheckoutMetadata, MetadataError};
use crate::processor::PaymentProcessor;
use crate::webhook::{
    CheckoutEvent, InvoiceSnapshot, ProcessorEvent, SubscriptionSnapshot, SucceededTransaction, WebhookVerifier,
};

/// How an accepted event was handled. All three acknowledge with 200.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// State changed
    Processed,
    /// An earlier delivery already did the work
    AlreadyProcessed,
    /// Nothing to do for this event
    Ignored,
}

/// Default budget for draft-store reads
pub const DEFAULT_DRAFT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookReconciler {
    verifier: WebhookVerifier,
    drafts: Arc<dyn DraftStore>,
    store: Arc<dyn CommerceStore>,
    processor: Arc<dyn PaymentProcessor>,
    materializer: Materializer,
    draft_timeout: Duration,
}

impl WebhookReconciler {
    pub fn new(
        verifier: WebhookVerifier,
        drafts: Arc<dyn DraftStore>,
        store: Arc<dyn CommerceStore>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        Self {
            verifier,
            drafts,
            materializer: Materializer::new(store.clone(), processor.clone()),
            processor,
            store,
            draft_timeout: DEFAULT_DRAFT_TIMEOUT,
        }
    }

    /// Budget for processor and draft-store calls made while handling an event
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.materializer = self.materializer.with_subscription_timeout(timeout);
        self.draft_timeout = timeout;
        self
    }

    /// Verify and handle a raw delivery
    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> Result<ReconcileOutcome> {
        let verified = signature
            .ok_or_else(|| CheckoutError::SignatureVerification("missing signature header".into()))
            .and_then(|header| self.verifier.verify(payload, header));
        if let Err(e) = verified {
            tracing::warn!(target: "security", error = %e, "Rejected webhook delivery");
            return Err(e);
        }

        let event = match ProcessorEvent::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable webhook payload");
                return Ok(ReconcileOutcome::Ignored);
            }
        };

        self.handle_event(&event).await
    }

    /// Handle an already verified event
    pub async fn handle_event(&self, event: &ProcessorEvent) -> Result<ReconcileOutcome> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Processing webhook event");

        let parsed = match CheckoutEvent::parse(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "Ignoring malformed event object");
                return Ok(ReconcileOutcome::Ignored);
            }
        };

        let outcome = match parsed {
            CheckoutEvent::TransactionSucceeded(transaction) => self.transaction_succeeded(&transaction).await,
            CheckoutEvent::SubscriptionChanged(snapshot) => self.subscription_changed(&snapshot).await,
            CheckoutEvent::InvoicePaid(invoice) => self.invoice_paid(&invoice).await,
            CheckoutEvent::InvoicePaymentFailed(invoice) => self.invoice_payment_failed(&invoice).await,
            CheckoutEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event");
                Ok(ReconcileOutcome::Ignored)
            }
        };

        match outcome {
            Ok(outcome) => {
                tracing::debug!(event_id = %event.id, outcome = ?outcome, "Webhook event handled");
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handling failed, awaiting redelivery"
                );
                Err(match e {
                    CheckoutError::Materialization(_) => e,
                    other => CheckoutError::Materialization(other.to_string()),
                })
            }
        }
    }

    async fn transaction_succeeded(&self, transaction: &SucceededTransaction) -> Result<ReconcileOutcome> {
        let metadata = match CheckoutMetadata::from_map(&transaction.metadata) {
            Ok(metadata) => metadata,
            Err(MetadataError::NotCheckout) => {
                tracing::debug!(transaction_id = %transaction.id, "Transaction not opened by checkout");
                return Ok(ReconcileOutcome::Ignored);
            }
            Err(e) => {
                tracing::warn!(transaction_id = %transaction.id, error = %e, "Ignoring transaction with bad metadata");
                return Ok(ReconcileOutcome::Ignored);
            }
        };
        let key = &metadata.draft_key;

        let Some(context) = within(self.draft_timeout, "read draft", self.drafts.get(key)).await? else {
            tracing::info!(draft_key = %key, transaction_id = %transaction.id, "Draft already consumed");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        };

        if metadata.subscription != context.is_subscription_bearing() {
            tracing::warn!(draft_key = %key, "Transaction metadata disagrees with draft contents");
        }

        match self.materializer.materialize(key, &context, transaction).await? {
            Materialized::Created { .. } => {}
            Materialized::Duplicate => {
                // The draft belongs to whichever delivery committed the order
                tracing::info!(draft_key = %key, "Order already materialized by another delivery");
                return Ok(ReconcileOutcome::AlreadyProcessed);
            }
        }

        if metadata.save_payment_method {
            self.keep_payment_method(&metadata, &context, transaction).await;
        }

        // The unique draft key on the order is the real guard; a failed
        // delete only leaves the draft to expire
        if let Err(e) = self.drafts.delete(key).await {
            tracing::warn!(draft_key = %key, error = %e, "Failed to delete consumed draft");
        }

        Ok(ReconcileOutcome::Processed)
    }

    /// Make the confirmed method the customer's default for later charges.
    /// The order is already committed, so failures are only logged.
    async fn keep_payment_method(
        &self,
        metadata: &CheckoutMetadata,
        context: &CheckoutContext,
        transaction: &SucceededTransaction,
    ) {
        let key = &metadata.draft_key;
        let customer = context
            .billing_customer_id
            .as_deref()
            .or(transaction.customer_id.as_deref());
        let method = transaction
            .payment_method_id
            .as_deref()
            .or(metadata.saved_payment_method.as_deref());

        let (Some(customer), Some(method)) = (customer, method) else {
            tracing::warn!(draft_key = %key, "Cannot keep payment method without a customer and a method");
            return;
        };

        let saved = within(
            self.draft_timeout,
            "set default payment method",
            self.processor.set_default_payment_method(customer, method),
        )
        .await;
        match saved {
            Ok(()) => tracing::info!(draft_key = %key, customer_id = %customer, "Payment method kept on file"),
            Err(e) => tracing::warn!(draft_key = %key, error = %e, "Failed to keep payment method"),
        }
    }

    async fn subscription_changed(&self, snapshot: &SubscriptionSnapshot) -> Result<ReconcileOutcome> {
        let update = SubscriptionUpdate {
            status: Some(snapshot.status),
            cancel_at_period_end: Some(snapshot.cancel_at_period_end),
            current_period_end: snapshot.current_period_end,
            collection_paused: Some(snapshot.collection_paused),
        };

        match self.store.update_subscription(&snapshot.external_id, &update).await? {
            Some(subscription) => {
                tracing::info!(
                    subscription_id = %subscription.external_id,
                    status = %subscription.status,
                    cancel_at_period_end = subscription.cancel_at_period_end,
                    "Subscription synced"
                );
                Ok(ReconcileOutcome::Processed)
            }
            None => {
                tracing::info!(subscription_id = %snapshot.external_id, "No local subscription to sync");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn invoice_paid(&self, invoice: &InvoiceSnapshot) -> Result<ReconcileOutcome> {
        Ok(match self.materializer.record_invoice_paid(invoice).await? {
            RenewalRecorded::Created(_) | RenewalRecorded::PeriodUpdated => ReconcileOutcome::Processed,
            RenewalRecorded::Duplicate => {
                tracing::info!(invoice_id = %invoice.id, "Renewal already recorded");
                ReconcileOutcome::AlreadyProcessed
            }
            RenewalRecorded::UnknownSubscription => {
                tracing::info!(invoice_id = %invoice.id, "Invoice has no local subscription");
                ReconcileOutcome::Ignored
            }
        })
    }

    async fn invoice_payment_failed(&self, invoice: &InvoiceSnapshot) -> Result<ReconcileOutcome> {
        let Some(ref external_id) = invoice.subscription_id else {
            return Ok(ReconcileOutcome::Ignored);
        };

        let update = SubscriptionUpdate::status(SubscriptionStatus::PastDue);
        match self.store.update_subscription(external_id, &update).await? {
            Some(_) => {
                tracing::warn!(subscription_id = %external_id, invoice_id = %invoice.id, "Subscription past due");
                Ok(ReconcileOutcome::Processed)
            }
            None => {
                tracing::info!(subscription_id = %external_id, "No local subscription for failed invoice");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }
}
