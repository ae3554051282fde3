//! Account Profile
//!
//! The slice of the account record checkout reads and writes. Accounts
//! themselves are managed elsewhere.

use serde::{Deserialize, Serialize};

use crate::checkout::{ContactInfo, ShippingAddress, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,

    #[serde(default)]
    pub phone: Option<String>,

    /// Name used when creating the billing identity
    #[serde(default)]
    pub name: Option<String>,

    /// Processor billing identity, set on first subscription checkout
    #[serde(default)]
    pub billing_customer_id: Option<String>,

    #[serde(default)]
    pub default_address: Option<ShippingAddress>,
}

impl UserProfile {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            email: email.into(),
            phone: None,
            name: None,
            billing_customer_id: None,
            default_address: None,
        }
    }

    pub fn contact(&self) -> ContactInfo {
        ContactInfo {
            email: self.email.clone(),
            phone: self.phone.clone(),
        }
    }
}
