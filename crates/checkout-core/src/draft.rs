//! Checkout Draft Store
//!
//! Short-lived, keyed storage for [`CheckoutContext`]s. A draft is written
//! once before a payment transaction is opened and read once by the webhook
//! that materializes it.

#[cfg(feature = "memory-drafts")]
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(feature = "memory-drafts")]
use moka::future::Cache;

use crate::checkout::{CheckoutContext, DraftKey};
use crate::error::Result;

/// Default time-to-live of an unconsumed draft
pub const DEFAULT_DRAFT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Draft storage trait
#[async_trait]
pub trait DraftStore: Send + Sync {
    /// Persist a context under a freshly generated key
    async fn create(&self, context: &CheckoutContext) -> Result<DraftKey>;

    /// Look up a draft. `None` means consumed, expired or never created.
    async fn get(&self, key: &DraftKey) -> Result<Option<CheckoutContext>>;

    /// Remove a draft after it has been materialized
    async fn delete(&self, key: &DraftKey) -> Result<()>;
}

/// In-memory draft store with time-to-live expiry (for development/testing)
#[cfg(feature = "memory-drafts")]
pub struct MemoryDraftStore {
    drafts: Cache<DraftKey, Arc<CheckoutContext>>,
}

#[cfg(feature = "memory-drafts")]
impl Default for MemoryDraftStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "memory-drafts")]
impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_DRAFT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            drafts: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[cfg(feature = "memory-drafts")]
#[async_trait]
impl DraftStore for MemoryDraftStore {
    async fn create(&self, context: &CheckoutContext) -> Result<DraftKey> {
        let key = DraftKey::generate();
        self.drafts.insert(key.clone(), Arc::new(context.clone())).await;
        tracing::debug!(draft_key = %key, "Stored checkout draft");
        Ok(key)
    }

    async fn get(&self, key: &DraftKey) -> Result<Option<CheckoutContext>> {
        Ok(self.drafts.get(key).await.map(|ctx| ctx.as_ref().clone()))
    }

    async fn delete(&self, key: &DraftKey) -> Result<()> {
        self.drafts.invalidate(key).await;
        Ok(())
    }
}
