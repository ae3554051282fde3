//! Order/Subscription Materializer
//!
//! The transactional write path behind the webhook. Initial orders are keyed
//! by their draft key and renewal orders by their invoice id; both keys are
//! unique in storage, so a racing duplicate delivery fails the insert instead
//! of producing a second order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use checkout_core::{
    CheckoutContext, CommerceStore, DraftKey, Money, NewOrder, NewSubscription, Order, OrderLine, OrderStatus,
    StoreError, Subscription, SubscriptionStatus, SubscriptionUpdate,
};

use crate::error::{CheckoutError, Result, within};
use crate::processor::{NewExternalSubscription, PaymentProcessor};
use crate::webhook::{InvoiceSnapshot, SucceededTransaction};

/// Default budget for creating one external subscription
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of materializing a checkout
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Materialized {
    Created {
        order: Order,
        subscriptions: Vec<Subscription>,
    },
    /// Another delivery already created the order for this draft
    Duplicate,
}

/// Result of recording a paid invoice
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewalRecorded {
    /// Renewal order created and period advanced
    Created(Order),
    /// First invoice of a checkout subscription; period updated only
    PeriodUpdated,
    /// Order for this invoice already exists
    Duplicate,
    /// No local subscription to renew
    UnknownSubscription,
}

/// Quantity and unit price for an invoiced line amount. Amounts that do not
/// divide evenly are recorded as one unit so the lines still sum to the total.
fn split_line_amount(amount: Money, quantity: u32) -> (u32, Money) {
    let per_unit = i64::from(quantity.max(1));
    if amount.cents() % per_unit == 0 {
        (quantity.max(1), Money::from_cents(amount.cents() / per_unit))
    } else {
        (1, amount)
    }
}

fn materialization(context: &str) -> impl FnOnce(StoreError) -> CheckoutError + '_ {
    move |e| CheckoutError::Materialization(format!("{context}: {e}"))
}

/// Creates orders and subscriptions
pub struct Materializer {
    store: Arc<dyn CommerceStore>,
    processor: Arc<dyn PaymentProcessor>,
    subscription_timeout: Duration,
}

impl Materializer {
    pub fn new(store: Arc<dyn CommerceStore>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self {
            store,
            processor,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
        }
    }

    pub fn with_subscription_timeout(mut self, timeout: Duration) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    /// Create the order, and a subscription per recurring line, in one
    /// storage transaction. Any failure rolls everything back.
    pub async fn materialize(
        &self,
        key: &DraftKey,
        context: &CheckoutContext,
        transaction: &SucceededTransaction,
    ) -> Result<Materialized> {
        let total = context
            .total()
            .ok_or_else(|| CheckoutError::Materialization("order total overflows".into()))?;

        let new_order = NewOrder {
            user_id: context.user_id,
            email: context.contact.email.clone(),
            phone: context.contact.phone.clone(),
            shipping: context.shipping.clone(),
            notes: context.notes.clone(),
            total,
            currency: context.currency.clone(),
            status: OrderStatus::Paid,
            lines: context
                .lines
                .iter()
                .map(|line| OrderLine {
                    product_id: line.product_id.clone(),
                    name: line.name.clone(),
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                })
                .collect(),
            draft_key: Some(key.clone()),
            subscription_id: None,
            invoice_id: None,
            payment_reference: Some(transaction.id.clone()),
        };

        let mut tx = self.store.begin().await.map_err(materialization("begin"))?;

        let order = match tx.insert_order(new_order).await {
            Ok(order) => order,
            Err(e) if e.is_conflict() => return Ok(Materialized::Duplicate),
            Err(e) => return Err(materialization("insert order")(e)),
        };

        let mut subscriptions = Vec::new();
        for (index, line) in context.lines.iter().enumerate() {
            let Some(interval) = line.interval else {
                continue;
            };

            let user_id = context
                .user_id
                .ok_or_else(|| CheckoutError::Materialization("recurring line without an owner".into()))?;
            let customer_id = context
                .billing_customer_id
                .clone()
                .or_else(|| transaction.customer_id.clone())
                .ok_or_else(|| CheckoutError::Materialization("recurring line without a billing identity".into()))?;

            let request = NewExternalSubscription {
                customer_id,
                price_id: line.price_id.clone(),
                quantity: line.quantity,
                payment_method_id: transaction
                    .payment_method_id
                    .clone()
                    .or_else(|| context.saved_payment_method_id.clone()),
                // Redelivery after a rollback gets the same external subscription back
                idempotency_key: format!("{key}:{index}:{}", line.price_id),
            };

            let external = within(
                self.subscription_timeout,
                "create subscription",
                self.processor.create_subscription(&request),
            )
            .await
            .inspect_err(|e| {
                tracing::error!(
                    draft_key = %key,
                    price_id = %line.price_id,
                    error = %e,
                    "External subscription creation failed"
                );
            })?;

            let subscription = tx
                .insert_subscription(NewSubscription {
                    user_id,
                    external_id: external.id.clone(),
                    price_id: line.price_id.clone(),
                    status: external.status,
                    interval,
                    current_period_end: external.current_period_end.unwrap_or_else(Utc::now),
                    origin_order_id: Some(order.id),
                })
                .await
                .map_err(materialization("insert subscription"))?;

            tracing::info!(
                draft_key = %key,
                subscription_id = %subscription.external_id,
                "Subscription created"
            );
            subscriptions.push(subscription);
        }

        tx.commit().await.map_err(materialization("commit"))?;

        tracing::info!(
            draft_key = %key,
            order_id = %order.id,
            total = %order.total,
            subscriptions = subscriptions.len(),
            "Order materialized"
        );

        Ok(Materialized::Created { order, subscriptions })
    }

    /// Advance a subscription's period and, for renewals, create the renewal
    /// order in the same transaction
    pub async fn record_invoice_paid(&self, invoice: &InvoiceSnapshot) -> Result<RenewalRecorded> {
        let Some(ref external_id) = invoice.subscription_id else {
            return Ok(RenewalRecorded::UnknownSubscription);
        };
        let Some(subscription) = self.store.subscription(external_id).await? else {
            return Ok(RenewalRecorded::UnknownSubscription);
        };

        let update = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            current_period_end: invoice.period_end(),
            ..Default::default()
        };

        if invoice.is_subscription_create() {
            self.store
                .update_subscription(external_id, &update)
                .await
                .map_err(materialization("update subscription"))?;
            return Ok(RenewalRecorded::PeriodUpdated);
        }

        let new_order = self.renewal_order(&subscription, invoice).await?;

        let mut tx = self.store.begin().await.map_err(materialization("begin"))?;
        tx.update_subscription(external_id, &update)
            .await
            .map_err(materialization("update subscription"))?;

        let order = match tx.insert_order(new_order).await {
            Ok(order) => order,
            Err(e) if e.is_conflict() => return Ok(RenewalRecorded::Duplicate),
            Err(e) => return Err(materialization("insert renewal order")(e)),
        };

        tx.commit().await.map_err(materialization("commit"))?;

        tracing::info!(
            subscription_id = %external_id,
            invoice_id = %invoice.id,
            order_id = %order.id,
            "Renewal order created"
        );

        Ok(RenewalRecorded::Created(order))
    }

    /// Contact and shipping come from the owner's profile, falling back to
    /// the order the subscription was created with
    async fn renewal_order(&self, subscription: &Subscription, invoice: &InvoiceSnapshot) -> Result<NewOrder> {
        let owner = self.store.user(subscription.user_id).await?;
        let origin = match subscription.origin_order_id {
            Some(id) => self.store.order(id).await?,
            None => None,
        };

        let shipping = owner
            .as_ref()
            .and_then(|u| u.default_address.clone())
            .or_else(|| origin.as_ref().map(|o| o.shipping.clone()))
            .ok_or_else(|| {
                CheckoutError::Materialization(format!(
                    "no shipping address for subscription {}",
                    subscription.external_id
                ))
            })?;
        let email = owner
            .as_ref()
            .map(|u| u.email.clone())
            .or_else(|| origin.as_ref().map(|o| o.email.clone()))
            .unwrap_or_default();
        let phone = owner
            .as_ref()
            .and_then(|u| u.phone.clone())
            .or_else(|| origin.as_ref().and_then(|o| o.phone.clone()));

        let mut lines: Vec<OrderLine> = invoice
            .lines
            .iter()
            .map(|line| {
                let (quantity, unit_price) = split_line_amount(line.amount, line.quantity);
                OrderLine {
                    product_id: line
                        .product_id
                        .clone()
                        .or_else(|| line.price_id.clone())
                        .unwrap_or_else(|| subscription.price_id.clone()),
                    name: line.description.clone().unwrap_or_else(|| "Subscription renewal".into()),
                    quantity,
                    unit_price,
                }
            })
            .collect();
        if lines.is_empty() {
            lines.push(OrderLine {
                product_id: subscription.price_id.clone(),
                name: "Subscription renewal".into(),
                quantity: 1,
                unit_price: invoice.amount_paid,
            });
        }

        Ok(NewOrder {
            user_id: Some(subscription.user_id),
            email,
            phone,
            shipping,
            notes: None,
            total: invoice.amount_paid,
            currency: if invoice.currency.is_empty() {
                origin.map(|o| o.currency).unwrap_or_else(|| "usd".into())
            } else {
                invoice.currency.clone()
            },
            status: OrderStatus::Paid,
            lines,
            draft_key: None,
            subscription_id: Some(subscription.external_id.clone()),
            invoice_id: Some(invoice.id.clone()),
            payment_reference: invoice.payment_intent_id.clone(),
        })
    }
}
