//! Transaction Initiator
//!
//! Turns a submitted checkout into a durable draft plus an open processor
//! transaction. Nothing is written to orders or subscriptions here; those only
//! exist once the webhook reports success.
//!
//! ```text
//! validate → reprice → classify → billing identity → draft → transaction
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use checkout_core::wire::{InitiateCheckoutRequest, InitiateCheckoutResponse, TransactionKind};
use checkout_core::{
    CartLine, CheckoutContext, CommerceStore, DraftStore, FieldErrors, Money, UserProfile,
};

use crate::error::{CheckoutError, Result, within};
use crate::metadata::CheckoutMetadata;
use crate::processor::{OpenTransaction, PaymentProcessor};

/// Default budget for each processor or draft-store call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens payment and setup transactions for checkouts
pub struct TransactionInitiator {
    processor: Arc<dyn PaymentProcessor>,
    drafts: Arc<dyn DraftStore>,
    store: Arc<dyn CommerceStore>,
    currency: String,
    timeout: Duration,
}

impl TransactionInitiator {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        drafts: Arc<dyn DraftStore>,
        store: Arc<dyn CommerceStore>,
    ) -> Self {
        Self {
            processor,
            drafts,
            store,
            currency: "usd".into(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into().to_lowercase();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Initiate a checkout for `user` (`None` for guests)
    pub async fn initiate(
        &self,
        user: Option<&UserProfile>,
        request: InitiateCheckoutRequest,
    ) -> Result<InitiateCheckoutResponse> {
        validate(&request)?;

        let lines = self.reprice(&request).await?;
        let subscription = lines.iter().any(CartLine::is_recurring);

        if subscription && user.is_none() {
            return Err(CheckoutError::AuthenticationRequired);
        }
        if user.is_none() && request.saved_payment_method_id.is_some() {
            return Err(CheckoutError::AuthenticationRequired);
        }

        let needs_customer = subscription || request.save_payment_method || request.saved_payment_method_id.is_some();
        let billing_customer_id = match user {
            Some(user) if needs_customer => Some(self.billing_identity(user, &request.contact.email).await?),
            Some(user) => user.billing_customer_id.clone(),
            None => None,
        };

        let context = CheckoutContext {
            user_id: user.map(|u| u.id),
            billing_customer_id: billing_customer_id.clone(),
            lines,
            contact: request.contact,
            shipping: request.shipping,
            notes: request.notes.filter(|n| !n.trim().is_empty()),
            saved_payment_method_id: request.saved_payment_method_id,
            save_payment_method: request.save_payment_method,
            currency: self.currency.clone(),
            created_at: Utc::now(),
        };

        let one_time = context.one_time_total().ok_or_else(total_too_large)?;
        context.total().ok_or_else(total_too_large)?;

        let (kind, amount) = if subscription && one_time == Money::ZERO {
            (TransactionKind::Setup, Money::ZERO)
        } else {
            (TransactionKind::Payment, one_time)
        };
        if kind == TransactionKind::Payment && amount <= Money::ZERO {
            let mut errors = FieldErrors::new();
            errors.push("lines", "Order total must be greater than zero");
            return Err(CheckoutError::Validation(errors));
        }

        // The draft must be durable before a transaction exists that points at it
        let draft_key = within(self.timeout, "create draft", self.drafts.create(&context)).await?;

        let metadata = CheckoutMetadata {
            draft_key: draft_key.clone(),
            subscription,
            saved_payment_method: context.saved_payment_method_id.clone(),
            save_payment_method: context.save_payment_method,
        };
        let open = OpenTransaction {
            kind,
            amount,
            currency: context.currency.clone(),
            customer_id: billing_customer_id,
            off_session: subscription || context.save_payment_method,
            payment_method_id: context.saved_payment_method_id.clone(),
            receipt_email: Some(context.contact.email.clone()),
            metadata,
        };

        let opened = match within(self.timeout, "open transaction", self.processor.open_transaction(&open)).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(cleanup) = self.drafts.delete(&draft_key).await {
                    tracing::warn!(draft_key = %draft_key, error = %cleanup, "Failed to discard unused draft");
                }
                return Err(e);
            }
        };

        tracing::info!(
            draft_key = %draft_key,
            transaction_id = %opened.id,
            kind = kind.as_str(),
            amount = %amount,
            subscription,
            "Checkout initiated"
        );

        Ok(InitiateCheckoutResponse {
            client_secret: opened.client_secret,
            draft_key,
            kind,
            amount,
        })
    }

    /// Replace client-sent amounts with the processor's canonical prices
    async fn reprice(&self, request: &InitiateCheckoutRequest) -> Result<Vec<CartLine>> {
        let mut lines = Vec::with_capacity(request.lines.len());

        for line in &request.lines {
            let price = within(self.timeout, "retrieve price", self.processor.price(&line.price_id))
                .await?
                .ok_or_else(|| CheckoutError::PriceResolution(format!("{} does not exist", line.price_id)))?;

            if !price.active {
                return Err(CheckoutError::PriceResolution(format!("{} is inactive", price.id)));
            }
            if !price.currency.eq_ignore_ascii_case(&self.currency) {
                return Err(CheckoutError::PriceResolution(format!(
                    "{} is priced in {}, expected {}",
                    price.id, price.currency, self.currency
                )));
            }
            if line.unit_price.is_some_and(|sent| sent != price.unit_amount) {
                tracing::debug!(
                    price_id = %price.id,
                    sent = ?line.unit_price,
                    canonical = %price.unit_amount,
                    "Ignoring client-sent unit price"
                );
            }

            lines.push(CartLine {
                product_id: if price.product_id.is_empty() {
                    line.product_id.clone()
                } else {
                    price.product_id
                },
                price_id: price.id,
                name: line.name.clone(),
                unit_price: price.unit_amount,
                quantity: line.quantity,
                interval: price.interval,
            });
        }

        Ok(lines)
    }

    /// Lookup-then-create the user's billing identity, persisting it on the
    /// account the first time
    async fn billing_identity(&self, user: &UserProfile, email: &str) -> Result<String> {
        if let Some(ref id) = user.billing_customer_id {
            return Ok(id.clone());
        }

        let found = within(self.timeout, "find customer", self.processor.find_customer(email)).await?;
        let customer_id = match found {
            Some(id) => id,
            None => {
                within(
                    self.timeout,
                    "create customer",
                    self.processor.create_customer(email, user.name.as_deref(), user.id),
                )
                .await?
            }
        };

        self.store.set_billing_customer(user.id, &customer_id).await?;
        tracing::info!(user_id = %user.id, customer_id = %customer_id, "Linked billing identity");

        Ok(customer_id)
    }
}

fn total_too_large() -> CheckoutError {
    let mut errors = FieldErrors::new();
    errors.push("lines", "Order total is too large");
    CheckoutError::Validation(errors)
}

fn validate(request: &InitiateCheckoutRequest) -> Result<()> {
    let mut errors = FieldErrors::new();

    if request.lines.is_empty() {
        errors.push("lines", "Your cart is empty");
    }
    for (i, line) in request.lines.iter().enumerate() {
        if line.quantity == 0 {
            errors.push(format!("lines[{i}].quantity"), "Quantity must be at least 1");
        }
        if line.price_id.trim().is_empty() {
            errors.push(format!("lines[{i}].price_id"), "Price is required");
        }
    }
    if let Err(contact) = request.contact.check() {
        errors.extend(contact);
    }
    if let Err(shipping) = request.shipping.check() {
        errors.extend(shipping);
    }

    errors.into_result().map_err(CheckoutError::Validation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{CanonicalPrice, MockProcessor};
    use checkout_core::wire::CartLineRequest;
    use checkout_core::{ContactInfo, MemoryCommerceStore, MemoryDraftStore, RecurringInterval, ShippingAddress};

    struct Harness {
        initiator: TransactionInitiator,
        processor: Arc<MockProcessor>,
        drafts: Arc<MemoryDraftStore>,
        store: MemoryCommerceStore,
    }

    fn harness(processor: MockProcessor) -> Harness {
        let processor = Arc::new(processor);
        let drafts = Arc::new(MemoryDraftStore::new());
        let store = MemoryCommerceStore::new();
        let initiator = TransactionInitiator::new(processor.clone(), drafts.clone(), Arc::new(store.clone()));
        Harness {
            initiator,
            processor,
            drafts,
            store,
        }
    }

    fn prices() -> MockProcessor {
        MockProcessor::new()
            .with_price(CanonicalPrice::one_time("price_tea", 599))
            .with_price(CanonicalPrice::recurring("price_box", 999, RecurringInterval::Month))
    }

    fn line(price_id: &str, quantity: u32, recurring: bool) -> CartLineRequest {
        CartLineRequest {
            product_id: format!("prod_{price_id}"),
            price_id: price_id.into(),
            name: price_id.into(),
            quantity,
            unit_price: None,
            recurring,
            interval: None,
        }
    }

    fn request(lines: Vec<CartLineRequest>) -> InitiateCheckoutRequest {
        InitiateCheckoutRequest {
            lines,
            contact: ContactInfo {
                email: "ada@example.com".into(),
                phone: Some("555-0100".into()),
            },
            shipping: ShippingAddress {
                name: "Ada Lovelace".into(),
                line1: "12 Analytical Way".into(),
                line2: None,
                city: "London".into(),
                state: "LDN".into(),
                postal_code: "N1 9GU".into(),
                country: "GB".into(),
            },
            notes: Some("Ring twice".into()),
            saved_payment_method_id: None,
            save_payment_method: false,
        }
    }

    fn signed_in(store: &MemoryCommerceStore) -> UserProfile {
        let user = UserProfile::new("ada@example.com");
        store.insert_user(user.clone()).unwrap();
        user
    }

    #[tokio::test]
    async fn test_guest_one_time_checkout() {
        let h = harness(prices());

        let response = h
            .initiator
            .initiate(None, request(vec![line("price_tea", 2, false)]))
            .await
            .unwrap();

        assert_eq!(response.kind, TransactionKind::Payment);
        assert_eq!(response.amount, Money::from_cents(1198));
        assert!(response.client_secret.contains("_secret_"));

        let draft = h.drafts.get(&response.draft_key).await.unwrap().unwrap();
        assert_eq!(draft.user_id, None);
        assert_eq!(draft.notes.as_deref(), Some("Ring twice"));
        assert_eq!(draft.total(), Some(Money::from_cents(1198)));

        let opened = h.processor.opened_transactions();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].metadata.draft_key, response.draft_key);
        assert!(!opened[0].off_session);
    }

    #[tokio::test]
    async fn test_client_amounts_are_ignored() {
        let h = harness(prices());
        let mut tampered = line("price_tea", 2, false);
        tampered.unit_price = Some(Money::from_cents(1));

        let response = h.initiator.initiate(None, request(vec![tampered])).await.unwrap();

        assert_eq!(response.amount, Money::from_cents(1198));
        assert_eq!(h.processor.opened_transactions()[0].amount, Money::from_cents(1198));
    }

    #[tokio::test]
    async fn test_subscription_requires_login() {
        let h = harness(prices());

        let err = h
            .initiator
            .initiate(None, request(vec![line("price_box", 1, true)]))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::AuthenticationRequired));
        assert!(h.processor.opened_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_flag_comes_from_canonical_price() {
        let h = harness(prices());

        // Client claims one-time, processor says monthly
        let err = h
            .initiator
            .initiate(None, request(vec![line("price_box", 1, false)]))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_signed_in_subscription_opens_setup() {
        let h = harness(prices());
        let user = signed_in(&h.store);

        let response = h
            .initiator
            .initiate(Some(&user), request(vec![line("price_box", 1, true)]))
            .await
            .unwrap();

        assert_eq!(response.kind, TransactionKind::Setup);
        assert_eq!(response.amount, Money::ZERO);

        let opened = &h.processor.opened_transactions()[0];
        assert!(opened.off_session);
        assert!(opened.metadata.subscription);
        assert!(opened.customer_id.is_some());

        let stored = h.store.user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_customer_id, opened.customer_id);
        assert_eq!(h.processor.customers_created(), 1);
    }

    #[tokio::test]
    async fn test_existing_customer_is_reused() {
        let h = harness(prices().with_customer("ada@example.com", "cus_existing"));
        let user = signed_in(&h.store);

        h.initiator
            .initiate(Some(&user), request(vec![line("price_box", 1, true)]))
            .await
            .unwrap();

        assert_eq!(h.processor.customers_created(), 0);
        let stored = h.store.user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_customer_id.as_deref(), Some("cus_existing"));
    }

    #[tokio::test]
    async fn test_mixed_cart_charges_one_time_subtotal() {
        let h = harness(prices());
        let user = signed_in(&h.store);

        let response = h
            .initiator
            .initiate(
                Some(&user),
                request(vec![line("price_tea", 2, false), line("price_box", 1, true)]),
            )
            .await
            .unwrap();

        assert_eq!(response.kind, TransactionKind::Payment);
        assert_eq!(response.amount, Money::from_cents(1198));
        assert!(h.processor.opened_transactions()[0].off_session);

        let draft = h.drafts.get(&response.draft_key).await.unwrap().unwrap();
        assert_eq!(draft.total(), Some(Money::from_cents(2197)));
    }

    #[tokio::test]
    async fn test_inactive_price() {
        let mut retired = CanonicalPrice::one_time("price_old", 100);
        retired.active = false;
        let h = harness(prices().with_price(retired));

        let err = h
            .initiator
            .initiate(None, request(vec![line("price_old", 1, false)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PriceResolution(_)));

        let err = h
            .initiator
            .initiate(None, request(vec![line("price_missing", 1, false)]))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PriceResolution(_)));
    }

    #[tokio::test]
    async fn test_validation_collects_field_errors() {
        let h = harness(prices());
        let mut bad = request(vec![line("price_tea", 0, false)]);
        bad.contact.email = "nope".into();
        bad.shipping.city = String::new();

        let Err(CheckoutError::Validation(errors)) = h.initiator.initiate(None, bad).await else {
            panic!("expected validation error");
        };
        assert!(errors.get("lines[0].quantity").is_some());
        assert!(errors.get("email").is_some());
        assert!(errors.get("city").is_some());
        assert!(h.processor.opened_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_saved_payment_method_carried_in_metadata() {
        let h = harness(prices());
        let user = signed_in(&h.store);
        let mut req = request(vec![line("price_tea", 1, false)]);
        req.saved_payment_method_id = Some("pm_saved".into());

        h.initiator.initiate(Some(&user), req).await.unwrap();

        let opened = &h.processor.opened_transactions()[0];
        assert_eq!(opened.payment_method_id.as_deref(), Some("pm_saved"));
        assert_eq!(opened.metadata.saved_payment_method.as_deref(), Some("pm_saved"));
    }

    #[tokio::test]
    async fn test_processor_rejection_is_retryable() {
        let h = harness(prices());
        h.processor.reject_transactions(true);

        let err = h
            .initiator
            .initiate(None, request(vec![line("price_tea", 1, false)]))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::Transaction(_)));
        assert!(err.is_retryable());
    }
}
