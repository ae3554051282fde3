//! Orders

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkout::{DraftKey, ShippingAddress, UserId};
use crate::money::Money;

/// Order identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fulfilment status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "PAID" => Some(OrderStatus::Paid),
            "PROCESSING" => Some(OrderStatus::Processing),
            "SHIPPED" => Some(OrderStatus::Shipped),
            "DELIVERED" => Some(OrderStatus::Delivered),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Allowed fulfilment transitions
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid | Cancelled)
                | (Paid, Processing | Shipped | Cancelled)
                | (Processing, Shipped | Cancelled)
                | (Shipped, Delivered)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order line item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

/// A persisted order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: Option<UserId>,
    pub email: String,
    pub phone: Option<String>,
    pub shipping: ShippingAddress,
    pub notes: Option<String>,
    pub total: Money,
    pub currency: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,

    /// Draft this order was materialized from (unique)
    pub draft_key: Option<DraftKey>,

    /// External subscription id when this is a renewal order
    pub subscription_id: Option<String>,

    /// Invoice that paid a renewal order (unique)
    pub invoice_id: Option<String>,

    /// Processor transaction reference
    pub payment_reference: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Insert payload for an order and its lines
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: Option<UserId>,
    pub email: String,
    pub phone: Option<String>,
    pub shipping: ShippingAddress,
    pub notes: Option<String>,
    pub total: Money,
    pub currency: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub draft_key: Option<DraftKey>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub payment_reference: Option<String>,
}

impl NewOrder {
    /// Uniqueness keys this order claims
    pub fn unique_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(ref key) = self.draft_key {
            keys.push(format!("draft:{key}"));
        }
        if let Some(ref invoice) = self.invoice_id {
            keys.push(format!("invoice:{invoice}"));
        }
        keys
    }

    pub fn into_order(self, id: OrderId, created_at: DateTime<Utc>) -> Order {
        Order {
            id,
            user_id: self.user_id,
            email: self.email,
            phone: self.phone,
            shipping: self.shipping,
            notes: self.notes,
            total: self.total,
            currency: self.currency,
            status: self.status,
            lines: self.lines,
            draft_key: self.draft_key,
            subscription_id: self.subscription_id,
            invoice_id: self.invoice_id,
            payment_reference: self.payment_reference,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
    }
}
