//! Checkout Metadata
//!
//! Typed, versioned payload carried in a transaction's metadata so the
//! webhook can find its draft. Anything that does not decode is reported as
//! a [`MetadataError`] and the event is ignored.

use std::collections::HashMap;

use checkout_core::DraftKey;
use thiserror::Error;

/// Current schema version
pub const SCHEMA_VERSION: &str = "1";

const KEY_SCHEMA: &str = "checkout_schema";
const KEY_DRAFT: &str = "draft_key";
const KEY_SUBSCRIPTION: &str = "subscription";
const KEY_SAVED_METHOD: &str = "saved_payment_method";
const KEY_SAVE_METHOD: &str = "save_payment_method";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// No schema marker: not a transaction opened by checkout
    #[error("transaction was not opened by checkout")]
    NotCheckout,

    #[error("unsupported checkout metadata schema {0:?}")]
    UnsupportedSchema(String),

    #[error("missing metadata field {0}")]
    Missing(&'static str),

    #[error("malformed metadata field {0}")]
    Malformed(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub draft_key: DraftKey,

    /// Whether the draft holds recurring lines
    pub subscription: bool,

    /// Saved payment method the shopper chose to pay with
    pub saved_payment_method: Option<String>,

    /// Keep the new payment method on file
    pub save_payment_method: bool,
}

impl CheckoutMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(KEY_SCHEMA.to_string(), SCHEMA_VERSION.to_string());
        map.insert(KEY_DRAFT.to_string(), self.draft_key.to_string());
        map.insert(KEY_SUBSCRIPTION.to_string(), self.subscription.to_string());
        map.insert(KEY_SAVE_METHOD.to_string(), self.save_payment_method.to_string());
        if let Some(ref pm) = self.saved_payment_method {
            map.insert(KEY_SAVED_METHOD.to_string(), pm.clone());
        }
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, MetadataError> {
        let schema = map.get(KEY_SCHEMA).ok_or(MetadataError::NotCheckout)?;
        if schema != SCHEMA_VERSION {
            return Err(MetadataError::UnsupportedSchema(schema.clone()));
        }

        let draft_key = map.get(KEY_DRAFT).ok_or(MetadataError::Missing(KEY_DRAFT))?;
        let draft_key = DraftKey::parse(draft_key).ok_or(MetadataError::Malformed(KEY_DRAFT))?;

        Ok(Self {
            draft_key,
            subscription: flag(map, KEY_SUBSCRIPTION)?,
            saved_payment_method: map.get(KEY_SAVED_METHOD).filter(|s| !s.is_empty()).cloned(),
            save_payment_method: flag(map, KEY_SAVE_METHOD)?,
        })
    }
}

/// Absent flags read as `false`
fn flag(map: &HashMap<String, String>, key: &'static str) -> Result<bool, MetadataError> {
    match map.get(key).map(String::as_str) {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(_) => Err(MetadataError::Malformed(key)),
    }
}
