//! Subscriptions
//!
//! Local mirror of processor-side subscriptions. Rows are never deleted;
//! cancellation is a status transition. Every update is a set of absolute
//! values keyed by the external subscription id, so replaying one is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkout::{RecurringInterval, UserId};
use crate::order::OrderId;

/// Processor subscription status vocabulary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Unrecognised strings map to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::Unknown,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted subscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: UserId,

    /// Processor subscription id (unique)
    pub external_id: String,

    /// Processor price id
    pub price_id: String,

    pub status: SubscriptionStatus,
    pub interval: RecurringInterval,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub collection_paused: bool,

    /// Order the subscription was created with
    pub origin_order_id: Option<OrderId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Apply an update in place
    pub fn apply(&mut self, update: &SubscriptionUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(cancel) = update.cancel_at_period_end {
            self.cancel_at_period_end = cancel;
        }
        if let Some(end) = update.current_period_end {
            self.current_period_end = end;
        }
        if let Some(paused) = update.collection_paused {
            self.collection_paused = paused;
        }
        self.updated_at = now;
    }
}

/// Insert payload for a subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub external_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub interval: RecurringInterval,
    pub current_period_end: DateTime<Utc>,
    pub origin_order_id: Option<OrderId>,
}

impl NewSubscription {
    pub fn into_subscription(self, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            external_id: self.external_id,
            price_id: self.price_id,
            status: self.status,
            interval: self.interval,
            current_period_end: self.current_period_end,
            cancel_at_period_end: false,
            collection_paused: false,
            origin_order_id: self.origin_order_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Absolute-value update; `None` fields are left untouched
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub collection_paused: Option<bool>,
}

impl SubscriptionUpdate {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}
