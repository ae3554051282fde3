//! Subscription self-service
//!
//! Owners can cancel at period end, pause collection or resume. The action
//! goes to the processor first; its answer is then written to the local row
//! with the same absolute-value update the webhook path uses, so a later
//! `customer.subscription.updated` for the same change is a no-op.

use std::sync::Arc;
use std::time::Duration;

use checkout_core::{CommerceStore, StoreError, Subscription, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result, within};
use crate::processor::PaymentProcessor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    /// Stop at the end of the current period
    Cancel,
    /// Keep the subscription but stop collecting payment
    Pause,
    /// Undo a pause or a pending cancellation
    Resume,
}

impl SubscriptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Cancel => "cancel",
            SubscriptionAction::Pause => "pause",
            SubscriptionAction::Resume => "resume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancel" => Some(SubscriptionAction::Cancel),
            "pause" => Some(SubscriptionAction::Pause),
            "resume" => Some(SubscriptionAction::Resume),
            _ => None,
        }
    }
}

pub struct SubscriptionManager {
    store: Arc<dyn CommerceStore>,
    processor: Arc<dyn PaymentProcessor>,
    timeout: Duration,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn CommerceStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            store,
            processor,
            timeout: crate::initiator::DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Subscriptions owned by `user_id`
    pub async fn list(&self, user_id: UserId) -> Result<Vec<Subscription>> {
        Ok(self.store.subscriptions_for_user(user_id).await?)
    }

    /// Apply `action` to a subscription the caller owns.
    ///
    /// Unknown and foreign subscriptions both report `NotFound` so callers
    /// cannot probe for other users' ids.
    pub async fn apply(&self, user_id: UserId, external_id: &str, action: SubscriptionAction) -> Result<Subscription> {
        let subscription = self
            .store
            .subscription(external_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription {external_id}")))?;

        if subscription.status == SubscriptionStatus::Canceled {
            return Err(StoreError::Conflict(format!("subscription {external_id} is canceled")).into());
        }

        let call = match action {
            SubscriptionAction::Cancel => self.processor.cancel_subscription(external_id),
            SubscriptionAction::Pause => self.processor.pause_subscription(external_id),
            SubscriptionAction::Resume => self.processor.resume_subscription(external_id),
        };
        let external = within(self.timeout, action.as_str(), call).await?;

        let updated = self
            .store
            .update_subscription(external_id, &external.to_update())
            .await?
            .ok_or_else(|| CheckoutError::Persistence(StoreError::NotFound(format!("subscription {external_id}"))))?;

        tracing::info!(
            subscription_id = %external_id,
            action = action.as_str(),
            status = %updated.status,
            cancel_at_period_end = updated.cancel_at_period_end,
            collection_paused = updated.collection_paused,
            "Subscription updated by owner"
        );

        Ok(updated)
    }
}
