//! Mock Processor
//!
//! In-memory processor for tests and local development. Prices are seeded by
//! the caller; every call is recorded so tests can assert on what was sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use checkout_core::wire::TransactionKind;
use checkout_core::{SubscriptionStatus, UserId};
use chrono::Utc;

use super::{
    CanonicalPrice, ExternalSubscription, NewExternalSubscription, OpenTransaction, OpenedTransaction,
    PaymentProcessor,
};
use crate::error::{CheckoutError, Result};

#[derive(Default)]
struct MockState {
    prices: HashMap<String, CanonicalPrice>,
    /// email -> customer id
    customers: HashMap<String, String>,
    transactions: Vec<OpenTransaction>,
    subscriptions: HashMap<String, ExternalSubscription>,
    /// idempotency key -> subscription id
    idempotency: HashMap<String, String>,
    /// customer id -> default payment method
    default_methods: HashMap<String, String>,
}

/// Mock payment processor with seeded prices
#[derive(Default)]
pub struct MockProcessor {
    state: Mutex<MockState>,
    sequence: AtomicUsize,
    customers_created: AtomicUsize,
    reject_transactions: AtomicBool,
    /// Fail subscription creation once this many have succeeded
    subscription_budget: Mutex<Option<usize>>,
    subscription_delay: Mutex<Option<Duration>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a price
    pub fn with_price(self, price: CanonicalPrice) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.prices.insert(price.id.clone(), price);
        }
        self
    }

    /// Seed an existing billing identity
    pub fn with_customer(self, email: &str, customer_id: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.customers.insert(email.to_string(), customer_id.to_string());
        }
        self
    }

    /// Make `open_transaction` fail
    pub fn reject_transactions(&self, reject: bool) {
        self.reject_transactions.store(reject, Ordering::SeqCst);
    }

    /// Allow `count` more subscription creations, then fail
    pub fn fail_subscriptions_after(&self, count: usize) {
        if let Ok(mut budget) = self.subscription_budget.lock() {
            *budget = Some(count);
        }
    }

    /// Delay subscription creation (for timeout tests)
    pub fn delay_subscriptions(&self, delay: Duration) {
        if let Ok(mut slot) = self.subscription_delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn opened_transactions(&self) -> Vec<OpenTransaction> {
        self.state.lock().map(|s| s.transactions.clone()).unwrap_or_default()
    }

    pub fn subscriptions(&self) -> Vec<ExternalSubscription> {
        self.state
            .lock()
            .map(|s| s.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Default payment method recorded for a customer
    pub fn default_payment_method(&self, customer_id: &str) -> Option<String> {
        self.state.lock().ok()?.default_methods.get(customer_id).cloned()
    }

    pub fn customers_created(&self) -> usize {
        self.customers_created.load(Ordering::SeqCst)
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| CheckoutError::Processor("mock state poisoned".into()))
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_mock{}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update(&self, external_id: &str, f: impl FnOnce(&mut ExternalSubscription)) -> Result<ExternalSubscription> {
        let mut state = self.state()?;
        let subscription = state
            .subscriptions
            .get_mut(external_id)
            .ok_or_else(|| CheckoutError::Processor(format!("No such subscription: {external_id}")))?;
        f(subscription);
        Ok(subscription.clone())
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn price(&self, price_id: &str) -> Result<Option<CanonicalPrice>> {
        Ok(self.state()?.prices.get(price_id).cloned())
    }

    async fn find_customer(&self, email: &str) -> Result<Option<String>> {
        Ok(self.state()?.customers.get(email).cloned())
    }

    async fn create_customer(&self, email: &str, _name: Option<&str>, _user_id: UserId) -> Result<String> {
        let id = self.next_id("cus");
        self.state()?.customers.insert(email.to_string(), id.clone());
        self.customers_created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn open_transaction(&self, request: &OpenTransaction) -> Result<OpenedTransaction> {
        if self.reject_transactions.load(Ordering::SeqCst) {
            return Err(CheckoutError::Transaction("processor unavailable".into()));
        }

        let prefix = match request.kind {
            TransactionKind::Payment => "pi",
            TransactionKind::Setup => "seti",
        };
        let id = self.next_id(prefix);
        self.state()?.transactions.push(request.clone());

        Ok(OpenedTransaction {
            client_secret: format!("{id}_secret_mock"),
            id,
        })
    }

    async fn create_subscription(&self, request: &NewExternalSubscription) -> Result<ExternalSubscription> {
        let delay = self.subscription_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state()?;
        if let Some(id) = state.idempotency.get(&request.idempotency_key) {
            if let Some(existing) = state.subscriptions.get(id) {
                return Ok(existing.clone());
            }
        }

        {
            let mut budget = self
                .subscription_budget
                .lock()
                .map_err(|_| CheckoutError::Processor("mock state poisoned".into()))?;
            match *budget {
                Some(0) => return Err(CheckoutError::Processor("card declined for subscription".into())),
                Some(ref mut n) => *n -= 1,
                None => {}
            }
        }

        let interval_days = match state.prices.get(&request.price_id).and_then(|p| p.interval) {
            Some(checkout_core::RecurringInterval::Day) => 1,
            Some(checkout_core::RecurringInterval::Week) => 7,
            Some(checkout_core::RecurringInterval::Year) => 365,
            _ => 30,
        };

        let subscription = ExternalSubscription {
            id: self.next_id("sub"),
            status: SubscriptionStatus::Active,
            current_period_end: Some(Utc::now() + chrono::Duration::days(interval_days)),
            cancel_at_period_end: false,
            collection_paused: false,
        };
        state
            .idempotency
            .insert(request.idempotency_key.clone(), subscription.id.clone());
        state.subscriptions.insert(subscription.id.clone(), subscription.clone());

        Ok(subscription)
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        self.update(external_id, |s| s.cancel_at_period_end = true)
    }

    async fn pause_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        self.update(external_id, |s| s.collection_paused = true)
    }

    async fn resume_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        self.update(external_id, |s| {
            s.collection_paused = false;
            s.cancel_at_period_end = false;
        })
    }

    async fn set_default_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()> {
        self.state()?
            .default_methods
            .insert(customer_id.to_string(), payment_method_id.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "MockProcessor"
    }
}
