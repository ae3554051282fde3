//! Postgres Stores
//!
//! sqlx-backed [`DraftStore`] and [`CommerceStore`]. Uniqueness of
//! `orders.draft_key`, `orders.invoice_id` and `subscriptions.external_id` is
//! enforced by the schema in `migrations/`; violations surface as
//! [`StoreError::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::checkout::{CheckoutContext, DraftKey, RecurringInterval, ShippingAddress, UserId};
use crate::draft::DraftStore;
use crate::error::{Result, StoreError};
use crate::money::Money;
use crate::order::{NewOrder, Order, OrderId, OrderLine, OrderStatus};
use crate::store::{CommerceStore, StoreTransaction};
use crate::subscription::{NewSubscription, Subscription, SubscriptionStatus, SubscriptionUpdate};
use crate::user::UserProfile;

/// Create a connection pool with conservative defaults
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?)
}

/// Apply the bundled schema migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
}

// ============================================================================
// Drafts
// ============================================================================

pub struct PgDraftStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgDraftStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Delete expired drafts, returning how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM checkout_drafts WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl DraftStore for PgDraftStore {
    async fn create(&self, context: &CheckoutContext) -> Result<DraftKey> {
        let key = DraftKey::generate();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| StoreError::Backend(format!("draft ttl out of range: {e}")))?;

        sqlx::query(
            "INSERT INTO checkout_drafts (draft_key, context, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(key.as_str())
        .bind(Json(context))
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await?;

        Ok(key)
    }

    async fn get(&self, key: &DraftKey) -> Result<Option<CheckoutContext>> {
        let row = sqlx::query(
            "SELECT context FROM checkout_drafts WHERE draft_key = $1 AND expires_at > now()",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<Json<CheckoutContext>, _>("context").map(|j| j.0))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn delete(&self, key: &DraftKey) -> Result<()> {
        sqlx::query("DELETE FROM checkout_drafts WHERE draft_key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Orders, subscriptions, users
// ============================================================================

const ORDER_COLUMNS: &str = "id, user_id, email, phone, shipping, notes, total_cents, currency, \
     status, draft_key, subscription_id, invoice_id, payment_reference, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, external_id, price_id, status, billing_interval, \
     current_period_end, cancel_at_period_end, collection_paused, origin_order_id, created_at, updated_at";

#[derive(Clone)]
pub struct PgCommerceStore {
    pool: PgPool,
}

impl PgCommerceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_lines(&self, order_id: Uuid) -> Result<Vec<OrderLine>> {
        let rows = sqlx::query(
            "SELECT product_id, name, quantity, unit_price_cents FROM order_lines \
             WHERE order_id = $1 ORDER BY position",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(line_from_row).collect()
    }

    async fn hydrate(&self, row: Option<PgRow>) -> Result<Option<Order>> {
        match row {
            Some(row) => {
                let id: Uuid = row.try_get("id")?;
                let lines = self.load_lines(id).await?;
                Ok(Some(order_from_row(&row, lines)?))
            }
            None => Ok(None),
        }
    }
}

fn line_from_row(row: &PgRow) -> Result<OrderLine> {
    let quantity: i32 = row.try_get("quantity")?;
    Ok(OrderLine {
        product_id: row.try_get("product_id")?,
        name: row.try_get("name")?,
        quantity: u32::try_from(quantity)
            .map_err(|_| StoreError::Backend(format!("negative quantity {quantity}")))?,
        unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
    })
}

fn order_from_row(row: &PgRow, lines: Vec<OrderLine>) -> Result<Order> {
    let status: String = row.try_get("status")?;
    let draft_key: Option<String> = row.try_get("draft_key")?;
    let user_id: Option<Uuid> = row.try_get("user_id")?;
    let Json(shipping): Json<ShippingAddress> = row.try_get("shipping")?;

    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id")?),
        user_id: user_id.map(UserId::from_uuid),
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        shipping,
        notes: row.try_get("notes")?,
        total: Money::from_cents(row.try_get("total_cents")?),
        currency: row.try_get("currency")?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown order status {status}")))?,
        lines,
        draft_key: draft_key.as_deref().and_then(DraftKey::parse),
        subscription_id: row.try_get("subscription_id")?,
        invoice_id: row.try_get("invoice_id")?,
        payment_reference: row.try_get("payment_reference")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription> {
    let status: String = row.try_get("status")?;
    let interval: String = row.try_get("billing_interval")?;
    let origin: Option<Uuid> = row.try_get("origin_order_id")?;

    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        external_id: row.try_get("external_id")?,
        price_id: row.try_get("price_id")?,
        status: SubscriptionStatus::parse(&status),
        interval: RecurringInterval::parse(&interval)
            .ok_or_else(|| StoreError::Backend(format!("unknown interval {interval}")))?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        collection_paused: row.try_get("collection_paused")?,
        origin_order_id: origin.map(OrderId::from_uuid),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserProfile> {
    let address: Option<Json<ShippingAddress>> = row.try_get("default_address")?;
    Ok(UserProfile {
        id: UserId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        billing_customer_id: row.try_get("billing_customer_id")?,
        default_address: address.map(|Json(a)| a),
    })
}

#[async_trait]
impl CommerceStore for PgCommerceStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn user(&self, id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT id, email, phone, name, billing_customer_id, default_address FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_billing_customer(&self, id: UserId, customer_id: &str) -> Result<()> {
        let done = sqlx::query("UPDATE users SET billing_customer_id = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate(row).await
    }

    async fn order_by_draft_key(&self, key: &DraftKey) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE draft_key = $1"))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        self.hydrate(row).await
    }

    async fn orders_for_user(&self, id: UserId) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(order) = self.hydrate(Some(row)).await? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn update_order_status(&self, id: OrderId, status: OrderStatus) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;
        let current = OrderStatus::parse(&current)
            .ok_or_else(|| StoreError::Backend(format!("unknown order status {current}")))?;

        if !current.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "order {id} cannot move from {current} to {status}"
            )));
        }

        sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.order(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("order {id}")))
    }

    async fn subscription(&self, external_id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn subscriptions_for_user(&self, id: UserId) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Wraps a sqlx transaction; sqlx rolls back on drop
struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn insert_order(&mut self, order: NewOrder) -> Result<Order> {
        let id = OrderId::new();
        let created_at: DateTime<Utc> = Utc::now();

        sqlx::query(
            "INSERT INTO orders (id, user_id, email, phone, shipping, notes, total_cents, currency, \
             status, draft_key, subscription_id, invoice_id, payment_reference, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(id.as_uuid())
        .bind(order.user_id.map(|u| u.as_uuid()))
        .bind(&order.email)
        .bind(order.phone.as_deref())
        .bind(Json(&order.shipping))
        .bind(order.notes.as_deref())
        .bind(order.total.cents())
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(order.draft_key.as_ref().map(DraftKey::as_str))
        .bind(order.subscription_id.as_deref())
        .bind(order.invoice_id.as_deref())
        .bind(order.payment_reference.as_deref())
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;

        for (position, line) in order.lines.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Backend("too many order lines".into()))?;
            let quantity = i32::try_from(line.quantity)
                .map_err(|_| StoreError::Backend(format!("quantity {} out of range", line.quantity)))?;

            sqlx::query(
                "INSERT INTO order_lines (order_id, position, product_id, name, quantity, unit_price_cents) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(id.as_uuid())
            .bind(position)
            .bind(&line.product_id)
            .bind(&line.name)
            .bind(quantity)
            .bind(line.unit_price.cents())
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(order.into_order(id, created_at))
    }

    async fn insert_subscription(&mut self, subscription: NewSubscription) -> Result<Subscription> {
        let row = sqlx::query(&format!(
            "INSERT INTO subscriptions (id, user_id, external_id, price_id, status, billing_interval, \
             current_period_end, origin_order_id) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(subscription.user_id.as_uuid())
        .bind(&subscription.external_id)
        .bind(&subscription.price_id)
        .bind(subscription.status.as_str())
        .bind(subscription.interval.as_str())
        .bind(subscription.current_period_end)
        .bind(subscription.origin_order_id.map(|o| o.as_uuid()))
        .fetch_one(&mut *self.tx)
        .await?;

        subscription_from_row(&row)
    }

    async fn update_subscription(
        &mut self,
        external_id: &str,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "UPDATE subscriptions SET \
               status = COALESCE($2, status), \
               cancel_at_period_end = COALESCE($3, cancel_at_period_end), \
               current_period_end = COALESCE($4, current_period_end), \
               collection_paused = COALESCE($5, collection_paused), \
               updated_at = now() \
             WHERE external_id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(external_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.cancel_at_period_end)
        .bind(update.current_period_end)
        .bind(update.collection_paused)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
