//! Stripe Processor
//!
//! Live [`PaymentProcessor`] backed by the Stripe API. Payment intents carry
//! one-time charges, setup intents authorize cards for recurring billing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use checkout_core::wire::TransactionKind;
use checkout_core::{Money, RecurringInterval, SubscriptionStatus, UserId};
use secrecy::{ExposeSecret, SecretString};
use stripe::{
    Client, CreateCustomer, CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods, CreateSetupIntent,
    CreateSetupIntentAutomaticPaymentMethods, CreateSubscription, CreateSubscriptionItems, Currency, Customer,
    CustomerId, CustomerInvoiceSettings, ListCustomers, PaymentIntent, PaymentIntentSetupFutureUsage,
    PaymentMethodId, Price, PriceId, RequestStrategy, SetupIntent, SetupIntentUsage, StripeError, Subscription,
    SubscriptionId, UpdateCustomer, UpdateSubscription, UpdateSubscriptionPauseCollection,
    UpdateSubscriptionPauseCollectionBehavior,
};

use super::{
    CanonicalPrice, ExternalSubscription, NewExternalSubscription, OpenTransaction, OpenedTransaction,
    PaymentProcessor,
};
use crate::error::{CheckoutError, Result};

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeProcessor {
    client: Client,
}

impl StripeProcessor {
    /// Create a new Stripe processor
    pub fn new(secret_key: &SecretString) -> Self {
        Self {
            client: Client::new(secret_key.expose_secret()),
        }
    }

    /// Get the underlying Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

impl std::fmt::Debug for StripeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeProcessor").finish_non_exhaustive()
    }
}

fn processor_error(operation: &str, error: StripeError) -> CheckoutError {
    CheckoutError::Processor(format!("{operation}: {error}"))
}

fn parse_customer_id(id: &str) -> Result<CustomerId> {
    id.parse()
        .map_err(|_| CheckoutError::Processor(format!("Invalid customer ID: {id}")))
}

fn parse_subscription_id(id: &str) -> Result<SubscriptionId> {
    id.parse()
        .map_err(|_| CheckoutError::Processor(format!("Invalid subscription ID: {id}")))
}

fn parse_payment_method_id(id: &str) -> Result<PaymentMethodId> {
    id.parse()
        .map_err(|_| CheckoutError::Transaction(format!("Invalid payment method ID: {id}")))
}

fn is_missing(error: &StripeError) -> bool {
    matches!(error, StripeError::Stripe(request) if request.http_status == 404)
}

fn price_from_stripe(price: Price) -> Result<CanonicalPrice> {
    let unit_amount = price
        .unit_amount
        .ok_or_else(|| CheckoutError::PriceResolution(format!("{} has no unit amount", price.id)))?;

    let interval = price.recurring.as_ref().map(|recurring| match recurring.interval {
        stripe::RecurringInterval::Day => RecurringInterval::Day,
        stripe::RecurringInterval::Week => RecurringInterval::Week,
        stripe::RecurringInterval::Month => RecurringInterval::Month,
        stripe::RecurringInterval::Year => RecurringInterval::Year,
    });

    Ok(CanonicalPrice {
        id: price.id.to_string(),
        product_id: price
            .product
            .as_ref()
            .map(|product| product.id().to_string())
            .unwrap_or_default(),
        unit_amount: Money::from_cents(unit_amount),
        currency: price.currency.map(|c| c.to_string()).unwrap_or_default(),
        active: price.active.unwrap_or(false),
        interval,
    })
}

fn subscription_from_stripe(subscription: &Subscription) -> ExternalSubscription {
    ExternalSubscription {
        id: subscription.id.to_string(),
        status: SubscriptionStatus::parse(subscription.status.as_str()),
        current_period_end: DateTime::from_timestamp(subscription.current_period_end, 0),
        cancel_at_period_end: subscription.cancel_at_period_end,
        collection_paused: subscription.pause_collection.is_some(),
    }
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn price(&self, price_id: &str) -> Result<Option<CanonicalPrice>> {
        let Ok(id) = price_id.parse::<PriceId>() else {
            return Ok(None);
        };

        match Price::retrieve(&self.client, &id, &[]).await {
            Ok(price) => price_from_stripe(price).map(Some),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(processor_error("retrieve price", e)),
        }
    }

    async fn find_customer(&self, email: &str) -> Result<Option<String>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = Customer::list(&self.client, &params)
            .await
            .map_err(|e| processor_error("list customers", e))?;

        Ok(customers.data.into_iter().next().map(|c| c.id.to_string()))
    }

    async fn create_customer(&self, email: &str, name: Option<&str>, user_id: UserId) -> Result<String> {
        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        params.metadata = Some(HashMap::from([("user_id".to_string(), user_id.to_string())]));

        let customer = Customer::create(&self.client, params)
            .await
            .map_err(|e| processor_error("create customer", e))?;

        tracing::info!(customer_id = %customer.id, user_id = %user_id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    async fn open_transaction(&self, request: &OpenTransaction) -> Result<OpenedTransaction> {
        let customer = request.customer_id.as_deref().map(parse_customer_id).transpose()?;
        let payment_method = request
            .payment_method_id
            .as_deref()
            .map(parse_payment_method_id)
            .transpose()?;
        let metadata = request.metadata.to_map();

        let (id, client_secret) = match request.kind {
            TransactionKind::Payment => {
                let currency = request
                    .currency
                    .parse::<Currency>()
                    .map_err(|_| CheckoutError::Config(format!("Unsupported currency: {}", request.currency)))?;

                let mut params = CreatePaymentIntent::new(request.amount.cents(), currency);
                params.customer = customer;
                params.payment_method = payment_method;
                params.metadata = Some(metadata);
                params.receipt_email = request.receipt_email.as_deref();
                params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
                    enabled: true,
                    allow_redirects: None,
                });
                if request.off_session {
                    params.setup_future_usage = Some(PaymentIntentSetupFutureUsage::OffSession);
                }

                let intent = PaymentIntent::create(&self.client, params)
                    .await
                    .map_err(|e| CheckoutError::Transaction(e.to_string()))?;
                (intent.id.to_string(), intent.client_secret)
            }
            TransactionKind::Setup => {
                let mut params = CreateSetupIntent::new();
                params.customer = customer;
                params.payment_method = payment_method;
                params.metadata = Some(metadata);
                params.usage = Some(SetupIntentUsage::OffSession);
                params.automatic_payment_methods = Some(CreateSetupIntentAutomaticPaymentMethods {
                    enabled: true,
                    allow_redirects: None,
                });

                let intent = SetupIntent::create(&self.client, params)
                    .await
                    .map_err(|e| CheckoutError::Transaction(e.to_string()))?;
                (intent.id.to_string(), intent.client_secret)
            }
        };

        let client_secret =
            client_secret.ok_or_else(|| CheckoutError::Transaction(format!("{id} returned no client secret")))?;

        tracing::info!(
            transaction_id = %id,
            kind = request.kind.as_str(),
            amount = %request.amount,
            draft_key = %request.metadata.draft_key,
            "Opened Stripe transaction"
        );

        Ok(OpenedTransaction { id, client_secret })
    }

    async fn create_subscription(&self, request: &NewExternalSubscription) -> Result<ExternalSubscription> {
        let client = self
            .client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key.clone()));

        let mut params = CreateSubscription::new(parse_customer_id(&request.customer_id)?);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(u64::from(request.quantity)),
            ..Default::default()
        }]);
        params.default_payment_method = request.payment_method_id.as_deref();

        let subscription = Subscription::create(&client, params)
            .await
            .map_err(|e| processor_error("create subscription", e))?;

        Ok(subscription_from_stripe(&subscription))
    }

    async fn cancel_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        let id = parse_subscription_id(external_id)?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = Subscription::update(&self.client, &id, params)
            .await
            .map_err(|e| processor_error("cancel subscription", e))?;

        Ok(subscription_from_stripe(&subscription))
    }

    async fn pause_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        let id = parse_subscription_id(external_id)?;

        let mut params = UpdateSubscription::new();
        params.pause_collection = Some(UpdateSubscriptionPauseCollection {
            behavior: UpdateSubscriptionPauseCollectionBehavior::Void,
            resumes_at: None,
        });

        let subscription = Subscription::update(&self.client, &id, params)
            .await
            .map_err(|e| processor_error("pause subscription", e))?;

        Ok(subscription_from_stripe(&subscription))
    }

    async fn resume_subscription(&self, external_id: &str) -> Result<ExternalSubscription> {
        let id = parse_subscription_id(external_id)?;

        // Clearing pause_collection takes an empty value, which the typed
        // update params cannot express
        let form = HashMap::from([("pause_collection", ""), ("cancel_at_period_end", "false")]);
        let subscription: Subscription = self
            .client
            .post_form(&format!("/subscriptions/{id}"), form)
            .await
            .map_err(|e| processor_error("resume subscription", e))?;

        Ok(subscription_from_stripe(&subscription))
    }

    async fn set_default_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<()> {
        let id = parse_customer_id(customer_id)?;
        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });

        Customer::update(&self.client, &id, params)
            .await
            .map_err(|e| processor_error("update customer", e))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "Stripe"
    }
}
