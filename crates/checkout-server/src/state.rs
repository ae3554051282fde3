//! Application State

use std::sync::Arc;

use checkout_core::{CommerceStore, DraftStore};
use checkout_payments::{
    PaymentProcessor, SubscriptionManager, TransactionInitiator, WebhookReconciler, WebhookVerifier,
};

use crate::auth::SessionResolver;
use crate::config::AppConfig;
use crate::error::ApiError;

/// Services that need the payment processor
pub struct Payments {
    pub initiator: TransactionInitiator,
    pub reconciler: WebhookReconciler,
    pub subscriptions: SubscriptionManager,
    pub processor_name: String,
    pub publishable_key: Option<String>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CommerceStore>,

    /// Resolves bearer tokens issued by the account service
    pub sessions: Arc<dyn SessionResolver>,

    /// Payment services (None if Stripe is not configured)
    pub payments: Option<Arc<Payments>>,

    pub currency: String,
}

impl AppState {
    /// Wire the checkout services. Payments stay disabled unless a processor
    /// is supplied and the webhook secret is configured.
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn CommerceStore>,
        drafts: Arc<dyn DraftStore>,
        sessions: Arc<dyn SessionResolver>,
        processor: Option<Arc<dyn PaymentProcessor>>,
    ) -> Self {
        let payments = match (processor, config.stripe_webhook_secret.clone()) {
            (Some(processor), Some(secret)) => {
                let verifier = WebhookVerifier::new(secret).with_tolerance(config.webhook_tolerance);

                Some(Arc::new(Payments {
                    initiator: TransactionInitiator::new(processor.clone(), drafts.clone(), store.clone())
                        .with_currency(config.currency.clone())
                        .with_timeout(config.processor_timeout),
                    reconciler: WebhookReconciler::new(verifier, drafts, store.clone(), processor.clone())
                        .with_timeout(config.processor_timeout),
                    subscriptions: SubscriptionManager::new(store.clone(), processor.clone())
                        .with_timeout(config.processor_timeout),
                    processor_name: processor.name().to_string(),
                    publishable_key: config.stripe_publishable_key.clone(),
                }))
            }
            _ => None,
        };

        Self {
            store,
            sessions,
            payments,
            currency: config.currency.clone(),
        }
    }

    pub fn payments(&self) -> Result<&Payments, ApiError> {
        self.payments.as_deref().ok_or(ApiError::PaymentsDisabled)
    }
}
