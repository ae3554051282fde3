//! # checkout-core
//!
//! Domain model and persistence seams for storefront checkout.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      checkout-core                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │ CheckoutFlow │  │  DraftStore  │  │   CommerceStore    │  │
//! │  │ (browser SM) │  │ (keyed, TTL) │──│ (orders, subs, tx) │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage traits come with in-memory implementations. Enable the `postgres`
//! feature for sqlx-backed ones.

pub mod checkout;
pub mod draft;
pub mod error;
pub mod flow;
pub mod money;
pub mod order;
pub mod store;
pub mod subscription;
pub mod user;
pub mod validation;
pub mod wire;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use checkout::{CartLine, CheckoutContext, ContactInfo, DraftKey, RecurringInterval, ShippingAddress, UserId};
pub use draft::{DEFAULT_DRAFT_TTL, DraftStore};
#[cfg(feature = "memory-drafts")]
pub use draft::MemoryDraftStore;
pub use error::{Result, StoreError};
pub use flow::{AuthContext, CartContext, CheckoutFlow, DraftKeySlot, FlowEffect, FlowError, Step};
pub use money::Money;
pub use order::{NewOrder, Order, OrderId, OrderLine, OrderStatus};
pub use store::{CommerceStore, MemoryCommerceStore, StoreTransaction};
pub use subscription::{NewSubscription, Subscription, SubscriptionStatus, SubscriptionUpdate};
pub use user::UserProfile;
pub use validation::{FieldError, FieldErrors};
