//! Checkout Context
//!
//! The contents of a checkout as captured before a payment transaction is
//! opened. A [`CheckoutContext`] is what the draft store persists under a
//! [`DraftKey`], so neither the browser redirect nor the webhook has to carry
//! order contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::money::Money;
use crate::validation::{self, FieldErrors, not_blank};

/// Account identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
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

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque draft key (formatted: `drft_` + 32 lowercase hex chars)
///
/// Generated from a v4 UUID, which draws on the operating system CSPRNG.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftKey(String);

impl DraftKey {
    const PREFIX: &'static str = "drft_";
    const HEX_LEN: usize = 32;

    /// Generate a new unguessable key
    pub fn generate() -> Self {
        Self(format!("{}{}", Self::PREFIX, Uuid::new_v4().simple()))
    }

    /// Parse a key received from an untrusted source
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix(Self::PREFIX)?;
        let well_formed = hex.len() == Self::HEX_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DraftKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Billing interval of a recurring price
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurringInterval {
    Day,
    Week,
    Month,
    Year,
}

impl RecurringInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringInterval::Day => "day",
            RecurringInterval::Week => "week",
            RecurringInterval::Month => "month",
            RecurringInterval::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(RecurringInterval::Day),
            "week" => Some(RecurringInterval::Week),
            "month" => Some(RecurringInterval::Month),
            "year" => Some(RecurringInterval::Year),
            _ => None,
        }
    }
}

/// One cart line, priced from the processor's canonical price record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,

    /// Processor price id the line is billed against
    pub price_id: String,

    /// Display name
    pub name: String,

    pub unit_price: Money,

    pub quantity: u32,

    /// `Some` for a recurring (subscription) line
    pub interval: Option<RecurringInterval>,
}

impl CartLine {
    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }

    /// `None` on overflow
    pub fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Contact details collected in the first checkout step
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ContactInfo {
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,

    #[serde(default)]
    #[validate(required(message = "Phone number is required"))]
    #[validate(custom(function = "not_blank", message = "Phone number is required"))]
    pub phone: Option<String>,
}

impl ContactInfo {
    /// Validate for the contact step: valid email and a non-empty phone
    pub fn check(&self) -> Result<(), FieldErrors> {
        validation::check(self)
    }
}

/// Shipping address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(custom(function = "not_blank", message = "Name is required"))]
    pub name: String,

    #[validate(custom(function = "not_blank", message = "Address is required"))]
    pub line1: String,

    #[serde(default)]
    pub line2: Option<String>,

    #[validate(custom(function = "not_blank", message = "City is required"))]
    pub city: String,

    #[validate(custom(function = "not_blank", message = "State is required"))]
    pub state: String,

    #[validate(custom(function = "not_blank", message = "Postal code is required"))]
    pub postal_code: String,

    #[validate(custom(function = "not_blank", message = "Country is required"))]
    pub country: String,
}

impl ShippingAddress {
    /// Every required field must be non-blank
    pub fn check(&self) -> Result<(), FieldErrors> {
        validation::check(self)
    }
}

/// Everything needed to materialize an order once payment succeeds.
///
/// Immutable once written to the draft store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutContext {
    /// Owning account, `None` for guest checkout
    pub user_id: Option<UserId>,

    /// Processor-side billing identity when one was resolved
    #[serde(default)]
    pub billing_customer_id: Option<String>,

    pub lines: Vec<CartLine>,

    pub contact: ContactInfo,

    pub shipping: ShippingAddress,

    #[serde(default)]
    pub notes: Option<String>,

    /// Pay with this already-saved payment method
    #[serde(default)]
    pub saved_payment_method_id: Option<String>,

    /// Keep the new payment method on file after confirmation
    #[serde(default)]
    pub save_payment_method: bool,

    /// ISO currency code, lowercase
    pub currency: String,

    pub created_at: DateTime<Utc>,
}

impl CheckoutContext {
    /// Whether any line is recurring
    pub fn is_subscription_bearing(&self) -> bool {
        self.lines.iter().any(CartLine::is_recurring)
    }

    /// Sum over all lines, `None` on overflow
    pub fn total(&self) -> Option<Money> {
        Money::checked_sum(self.lines.iter().map(CartLine::line_total).collect::<Option<Vec<_>>>()?)
    }

    /// Sum over non-recurring lines, charged when the transaction confirms
    pub fn one_time_total(&self) -> Option<Money> {
        let totals = self
            .lines
            .iter()
            .filter(|line| !line.is_recurring())
            .map(CartLine::line_total)
            .collect::<Option<Vec<_>>>()?;
        Money::checked_sum(totals)
    }

    pub fn recurring_lines(&self) -> impl Iterator<Item = &CartLine> {
        self.lines.iter().filter(|line| line.is_recurring())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_draft_key_format() {
        let key = DraftKey::generate();
        assert_eq!(key.as_str().len(), 5 + 32);
        assert_eq!(DraftKey::parse(key.as_str()), Some(key));
    }

    #[test]
    fn test_draft_key_rejects_malformed() {
        assert!(DraftKey::parse("").is_none());
        assert!(DraftKey::parse("drft_123").is_none());
        assert!(DraftKey::parse("key_0123456789abcdef0123456789abcdef").is_none());
        assert!(DraftKey::parse("drft_0123456789ABCDEF0123456789ABCDEF").is_none());
    }

    #[test]
    fn test_totals_split_recurring() {
        let ctx = context(vec![
            line("price_tea", 599, 2, None),
            line("price_club", 999, 1, Some(RecurringInterval::Month)),
        ]);

        assert!(ctx.is_subscription_bearing());
        assert_eq!(ctx.total(), Some(Money::from_cents(2197)));
        assert_eq!(ctx.one_time_total(), Some(Money::from_cents(1198)));
        assert_eq!(ctx.recurring_lines().count(), 1);
    }

    #[test]
    fn test_contact_requires_phone() {
        let contact = ContactInfo {
            email: "ada@example.com".into(),
            phone: None,
        };
        let errors = contact.check().unwrap_err();
        assert_eq!(errors.get("phone"), Some("Phone number is required"));
        assert!(errors.get("email").is_none());

        let blank = ContactInfo {
            phone: Some("   ".into()),
            ..contact
        };
        assert_eq!(blank.check().unwrap_err().get("phone"), Some("Phone number is required"));
    }

    #[test]
    fn test_contact_rejects_malformed_email() {
        let contact = ContactInfo {
            email: "ada.example.com".into(),
            phone: Some("+44 20 7946 0000".into()),
        };
        let errors = contact.check().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.get("email"), Some("Enter a valid email address"));
    }

    #[test]
    fn test_address_requires_all_fields() {
        let mut addr = address();
        addr.city.clear();
        addr.postal_code = " ".into();

        let errors = addr.check().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get("city"), Some("City is required"));
        assert_eq!(errors.get("postal_code"), Some("Postal code is required"));
        assert!(address().check().is_ok());
    }
}
