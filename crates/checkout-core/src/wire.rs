//! HTTP Payloads
//!
//! Request and response bodies shared by the server and the browser client.

use serde::{Deserialize, Serialize};

use crate::checkout::{ContactInfo, DraftKey, RecurringInterval, ShippingAddress};
use crate::money::Money;

/// A cart line as submitted by the browser. Amounts here are informational
/// only; the server reprices every line from the processor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineRequest {
    pub product_id: String,
    pub price_id: String,
    pub name: String,
    pub quantity: u32,

    #[serde(default)]
    pub unit_price: Option<Money>,

    #[serde(default)]
    pub recurring: bool,

    #[serde(default)]
    pub interval: Option<RecurringInterval>,
}

/// `POST /checkout/initiate`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateCheckoutRequest {
    pub lines: Vec<CartLineRequest>,
    pub contact: ContactInfo,
    pub shipping: ShippingAddress,

    #[serde(default)]
    pub notes: Option<String>,

    #[serde(default)]
    pub saved_payment_method_id: Option<String>,

    #[serde(default)]
    pub save_payment_method: bool,
}

/// Kind of processor transaction that was opened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Charge now
    Payment,
    /// Authorize a reusable payment method without charging
    Setup,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Payment => "payment",
            TransactionKind::Setup => "setup",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCheckoutResponse {
    pub client_secret: String,
    pub draft_key: DraftKey,
    pub kind: TransactionKind,

    /// Amount charged when the transaction confirms
    pub amount: Money,
}

/// Error body returned by every endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<crate::validation::FieldErrors>,
}
