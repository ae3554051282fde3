//! Commerce Store
//!
//! Persistence seam for orders, subscriptions and the account fields checkout
//! touches. Multi-row writes go through a [`StoreTransaction`] obtained from
//! [`CommerceStore::begin`]; dropping a transaction without committing rolls
//! it back.
//!
//! Two uniqueness guarantees carry the at-most-once semantics of
//! materialization: an order's draft key and an order's invoice id. A write
//! that would violate either fails with [`StoreError::Conflict`] instead of
//! inserting a second row. A write whose key is held by another open
//! transaction waits for that transaction to commit (conflict) or roll back
//! (proceeds), as a unique index does.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::checkout::{DraftKey, UserId};
use crate::error::{Result, StoreError};
use crate::order::{NewOrder, Order, OrderId, OrderStatus};
use crate::subscription::{NewSubscription, Subscription, SubscriptionUpdate};
use crate::user::UserProfile;

/// One multi-statement unit of work
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert an order with its lines. Fails with `Conflict` when the draft
    /// key or invoice id was already used.
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order>;

    /// Insert a subscription. Fails with `Conflict` on a duplicate external id.
    async fn insert_subscription(&mut self, subscription: NewSubscription) -> Result<Subscription>;

    /// Apply an absolute update to the subscription with this external id.
    /// `None` when no such row exists.
    async fn update_subscription(
        &mut self,
        external_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Commerce storage trait
#[async_trait]
pub trait CommerceStore: Send + Sync {
    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    async fn user(&self, id: UserId) -> Result<Option<UserProfile>>;

    /// Record the processor billing identity on the account
    async fn set_billing_customer(&self, id: UserId, customer_id: &str) -> Result<()>;

    async fn order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn order_by_draft_key(&self, key: &DraftKey) -> Result<Option<Order>>;

    /// Newest first
    async fn orders_for_user(&self, id: UserId) -> Result<Vec<Order>>;

    /// Move an order along its fulfilment lifecycle
    async fn update_order_status(&self, id: OrderId, status: OrderStatus) -> Result<Order>;

    async fn subscription(&self, external_id: &str) -> Result<Option<Subscription>>;

    async fn subscriptions_for_user(&self, id: UserId) -> Result<Vec<Subscription>>;

    /// Single-row subscription update in its own transaction
    async fn update_subscription(
        &self,
        external_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>> {
        let mut tx = self.begin().await?;
        let updated = tx.update_subscription(external_id, update).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Backend name for health reporting
    fn backend(&self) -> &'static str;
}

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, UserProfile>,
    orders: HashMap<OrderId, Order>,
    /// Committed uniqueness keys (`draft:..`, `invoice:..`)
    order_keys: HashMap<String, OrderId>,
    subscriptions: HashMap<String, Subscription>,
    /// Keys claimed by open transactions, the in-memory analogue of a
    /// unique-index lock
    reserved: HashSet<String>,
}

fn lock(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>> {
    tables
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
}

/// In-memory commerce store (for development/testing)
#[derive(Clone, Default)]
pub struct MemoryCommerceStore {
    tables: Arc<Mutex<Tables>>,
    /// Signalled whenever a transaction releases its reserved keys
    released: Arc<Notify>,
}

impl MemoryCommerceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account
    pub fn insert_user(&self, profile: UserProfile) -> Result<()> {
        lock(&self.tables)?.users.insert(profile.id, profile);
        Ok(())
    }

    /// Every order, for assertions in tests and the dev console
    pub fn all_orders(&self) -> Result<Vec<Order>> {
        Ok(lock(&self.tables)?.orders.values().cloned().collect())
    }
}

#[async_trait]
impl CommerceStore for MemoryCommerceStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            released: self.released.clone(),
            reserved: Vec::new(),
            orders: Vec::new(),
            subscriptions: Vec::new(),
            updates: Vec::new(),
            committed: false,
        }))
    }

    async fn user(&self, id: UserId) -> Result<Option<UserProfile>> {
        Ok(lock(&self.tables)?.users.get(&id).cloned())
    }

    async fn set_billing_customer(&self, id: UserId, customer_id: &str) -> Result<()> {
        let mut tables = lock(&self.tables)?;
        let user = tables
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        user.billing_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(lock(&self.tables)?.orders.get(&id).cloned())
    }

    async fn order_by_draft_key(&self, key: &DraftKey) -> Result<Option<Order>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .order_keys
            .get(&format!("draft:{key}"))
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn orders_for_user(&self, id: UserId) -> Result<Vec<Order>> {
        let tables = lock(&self.tables)?;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == Some(id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_order_status(&self, id: OrderId, status: OrderStatus) -> Result<Order> {
        let mut tables = lock(&self.tables)?;
        let order = tables
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;

        if !order.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "order {id} cannot move from {} to {status}",
                order.status
            )));
        }

        order.status = status;
        Ok(order.clone())
    }

    async fn subscription(&self, external_id: &str) -> Result<Option<Subscription>> {
        Ok(lock(&self.tables)?.subscriptions.get(external_id).cloned())
    }

    async fn subscriptions_for_user(&self, id: UserId) -> Result<Vec<Subscription>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.user_id == id)
            .cloned()
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Buffered writes, applied atomically on commit
struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    released: Arc<Notify>,
    reserved: Vec<String>,
    orders: Vec<(Vec<String>, Order)>,
    subscriptions: Vec<Subscription>,
    updates: Vec<(String, SubscriptionUpdate)>,
    committed: bool,
}

impl MemoryTransaction {
    /// Claim uniqueness keys. Fails if any is committed (or `committed`
    /// reports the row exists); waits while another transaction holds one.
    async fn reserve(&mut self, keys: &[String], committed: impl Fn(&Tables) -> bool + Send) -> Result<()> {
        let released = self.released.clone();
        loop {
            // Registered before checking so a release in between is not missed
            let mut notified = pin!(released.notified());
            notified.as_mut().enable();

            {
                let mut guard = lock(&self.tables)?;
                let tables: &mut Tables = &mut guard;
                let exists = committed(tables);
                if let Some(taken) = keys
                    .iter()
                    .find(|k| exists || tables.order_keys.contains_key(*k) || self.reserved.contains(*k))
                {
                    return Err(StoreError::Conflict(format!("duplicate key {taken}")));
                }
                if !keys.iter().any(|k| tables.reserved.contains(k)) {
                    for key in keys {
                        tables.reserved.insert(key.clone());
                        self.reserved.push(key.clone());
                    }
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    fn release(&mut self, tables: &mut Tables) {
        for key in self.reserved.drain(..) {
            tables.reserved.remove(&key);
        }
        self.released.notify_waiters();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        let keys = order.unique_keys();
        self.reserve(&keys, |_| false).await?;

        let order = order.into_order(OrderId::new(), Utc::now());
        self.orders.push((keys, order.clone()));
        Ok(order)
    }

    async fn insert_subscription(&mut self, subscription: NewSubscription) -> Result<Subscription> {
        let key = format!("subscription:{}", subscription.external_id);
        let external_id = subscription.external_id.clone();
        self.reserve(&[key], |tables| tables.subscriptions.contains_key(&external_id))
            .await?;

        let subscription = subscription.into_subscription(Utc::now());
        self.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &mut self,
        external_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>> {
        let current = {
            let pending = self
                .subscriptions
                .iter()
                .find(|s| s.external_id == external_id)
                .cloned();
            match pending {
                Some(s) => Some(s),
                None => lock(&self.tables)?.subscriptions.get(external_id).cloned(),
            }
        };

        let Some(mut subscription) = current else {
            return Ok(None);
        };

        for (id, earlier) in &self.updates {
            if id == external_id {
                subscription.apply(earlier, subscription.updated_at);
            }
        }
        subscription.apply(update, Utc::now());
        self.updates.push((external_id.to_string(), update.clone()));
        Ok(Some(subscription))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tables_arc = self.tables.clone();
        let mut tables = lock(&tables_arc)?;

        for (keys, order) in self.orders.drain(..) {
            for key in keys {
                tables.order_keys.insert(key, order.id);
            }
            tables.orders.insert(order.id, order);
        }
        for subscription in self.subscriptions.drain(..) {
            tables
                .subscriptions
                .insert(subscription.external_id.clone(), subscription);
        }
        let now = Utc::now();
        for (external_id, update) in self.updates.drain(..) {
            if let Some(row) = tables.subscriptions.get_mut(&external_id) {
                row.apply(&update, now);
            }
        }
        self.release(&mut tables);

        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.committed || self.reserved.is_empty() {
            return;
        }
        let tables = self.tables.clone();
        if let Ok(mut tables) = tables.lock() {
            self.release(&mut tables);
        }
    }
}
