//! Checkout Flow
//!
//! Browser-side state machine sequencing `auth_choice → contact → shipping →
//! payment`. It is UI-agnostic: the page feeds it user actions and carries out
//! the [`FlowEffect`]s it returns, so the same logic runs in the WASM
//! frontend and in native tests.
//!
//! ```text
//!  auth_choice ──guest/login──▶ contact ──valid──▶ shipping ──valid──▶ payment
//!   (skipped when signed in)                                   │
//!                                              first entry: Initiate effect
//! ```
//!
//! Completion flags never reset. Going back to a completed step keeps later
//! progress; only a change to contact, shipping or payment choice after a
//! transaction was opened discards that transaction, because the draft it
//! points at is immutable and would no longer match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkout::{ContactInfo, DraftKey, ShippingAddress};
use crate::user::UserProfile;
use crate::validation::FieldErrors;
use crate::wire::{CartLineRequest, InitiateCheckoutRequest, InitiateCheckoutResponse};

/// Checkout steps, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AuthChoice,
    Contact,
    Shipping,
    Payment,
}

/// Who is checking out. Created at session start, dropped at logout.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub profile: Option<UserProfile>,
}

impl AuthContext {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn signed_in(profile: UserProfile) -> Self {
        Self {
            profile: Some(profile),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.profile.is_some()
    }
}

/// What is being bought. Created with the cart, dropped when it is cleared.
#[derive(Clone, Debug, Default)]
pub struct CartContext {
    pub lines: Vec<CartLineRequest>,
}

impl CartContext {
    pub fn has_recurring(&self) -> bool {
        self.lines.iter().any(|l| l.recurring)
    }
}

/// Transaction lifecycle as seen by the browser
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    /// Request with this attempt number is in flight
    Initiating(u64),
    Ready(InitiateCheckoutResponse),
}

/// Side effect the page must perform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowEffect {
    None,
    /// Call `POST /checkout/initiate` with this body and report the result
    /// back under the same attempt number
    Initiate { attempt: u64, request: InitiateCheckoutRequest },
}

/// What the page hands to the processor's client SDK
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentHandoff {
    pub client_secret: String,
    pub draft_key: DraftKey,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Please correct the highlighted fields")]
    Validation(FieldErrors),

    #[error("Complete the previous steps first")]
    StepLocked(Step),

    #[error("Your cart is empty")]
    EmptyCart,

    #[error("Payment is not ready yet")]
    TransactionNotReady,

    #[error("Could not save checkout progress: {0}")]
    Slot(String),
}

/// Durable per-tab slot for the draft key, read back after a redirect
pub trait DraftKeySlot {
    fn store(&mut self, key: &DraftKey) -> Result<(), String>;
    fn load(&self) -> Option<DraftKey>;
    fn clear(&mut self);
}

/// Slot kept in memory (native tests, server-side rendering)
#[derive(Clone, Debug, Default)]
pub struct MemoryDraftKeySlot(Option<DraftKey>);

impl DraftKeySlot for MemoryDraftKeySlot {
    fn store(&mut self, key: &DraftKey) -> Result<(), String> {
        self.0 = Some(key.clone());
        Ok(())
    }

    fn load(&self) -> Option<DraftKey> {
        self.0.clone()
    }

    fn clear(&mut self) {
        self.0 = None;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Completion {
    auth: bool,
    contact: bool,
    shipping: bool,
}

/// The checkout flow controller
#[derive(Clone, Debug)]
pub struct CheckoutFlow {
    step: Step,
    done: Completion,
    cart: CartContext,
    authenticated: bool,
    contact: ContactInfo,
    shipping: ShippingAddress,
    notes: Option<String>,
    saved_payment_method_id: Option<String>,
    save_payment_method: bool,
    transaction: TransactionState,
    attempts: u64,
    banner: Option<String>,
    errors: FieldErrors,
}

impl CheckoutFlow {
    /// Start a checkout. Signed-in shoppers skip the auth choice and get
    /// contact and shipping pre-filled from their profile.
    pub fn new(cart: CartContext, auth: &AuthContext) -> Self {
        let mut flow = Self {
            step: Step::AuthChoice,
            done: Completion::default(),
            cart,
            authenticated: false,
            contact: ContactInfo::default(),
            shipping: ShippingAddress::default(),
            notes: None,
            saved_payment_method_id: None,
            save_payment_method: false,
            transaction: TransactionState::NotStarted,
            attempts: 0,
            banner: None,
            errors: FieldErrors::new(),
        };
        if let Some(ref profile) = auth.profile {
            flow.signed_in(profile);
        }
        flow
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn is_complete(&self, step: Step) -> bool {
        match step {
            Step::AuthChoice => self.done.auth,
            Step::Contact => self.done.contact,
            Step::Shipping => self.done.shipping,
            Step::Payment => matches!(self.transaction, TransactionState::Ready(_)),
        }
    }

    pub fn contact(&self) -> &ContactInfo {
        &self.contact
    }

    pub fn shipping(&self) -> &ShippingAddress {
        &self.shipping
    }

    pub fn transaction(&self) -> &TransactionState {
        &self.transaction
    }

    /// Retryable message to show above the current step
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn field_errors(&self) -> &FieldErrors {
        &self.errors
    }

    /// Continue without an account
    pub fn continue_as_guest(&mut self) -> Result<(), FlowError> {
        if self.cart.has_recurring() {
            // Subscriptions need an account; keep the shopper on the auth choice
            self.banner = Some("Please log in to buy a subscription.".into());
            return Err(FlowError::StepLocked(Step::AuthChoice));
        }
        self.done.auth = true;
        self.step = Step::Contact;
        self.banner = None;
        Ok(())
    }

    /// A login completed during checkout
    pub fn logged_in(&mut self, profile: &UserProfile) {
        self.signed_in(profile);
    }

    fn signed_in(&mut self, profile: &UserProfile) {
        self.authenticated = true;
        self.done.auth = true;
        if self.contact == ContactInfo::default() {
            self.contact = profile.contact();
        }
        if self.shipping == ShippingAddress::default() {
            if let Some(ref address) = profile.default_address {
                self.shipping = address.clone();
            }
        }
        if self.step == Step::AuthChoice {
            self.step = Step::Contact;
        }
        self.banner = None;
    }

    /// Re-enter an earlier or already reached step
    pub fn edit(&mut self, step: Step) -> Result<(), FlowError> {
        if !self.can_enter(step) {
            return Err(FlowError::StepLocked(step));
        }
        self.step = step;
        self.errors = FieldErrors::new();
        Ok(())
    }

    fn can_enter(&self, step: Step) -> bool {
        match step {
            Step::AuthChoice => !self.authenticated,
            Step::Contact => self.done.auth,
            Step::Shipping => self.done.auth && self.done.contact,
            Step::Payment => self.done.auth && self.done.contact && self.done.shipping,
        }
    }

    pub fn submit_contact(&mut self, contact: ContactInfo) -> Result<FlowEffect, FlowError> {
        if !self.can_enter(Step::Contact) {
            return Err(FlowError::StepLocked(Step::Contact));
        }
        if let Err(errors) = contact.check() {
            self.errors = errors.clone();
            return Err(FlowError::Validation(errors));
        }

        if contact != self.contact {
            self.contact = contact;
            self.discard_transaction();
        }
        self.done.contact = true;
        self.errors = FieldErrors::new();

        if self.done.shipping {
            Ok(self.enter_payment())
        } else {
            self.step = Step::Shipping;
            Ok(FlowEffect::None)
        }
    }

    pub fn submit_shipping(
        &mut self,
        shipping: ShippingAddress,
        notes: Option<String>,
    ) -> Result<FlowEffect, FlowError> {
        if !self.can_enter(Step::Shipping) {
            return Err(FlowError::StepLocked(Step::Shipping));
        }
        if let Err(errors) = shipping.check() {
            self.errors = errors.clone();
            return Err(FlowError::Validation(errors));
        }

        if shipping != self.shipping || notes != self.notes {
            self.shipping = shipping;
            self.notes = notes;
            self.discard_transaction();
        }
        self.done.shipping = true;
        self.errors = FieldErrors::new();

        Ok(self.enter_payment())
    }

    /// Choose a saved payment method or opt in to saving the new one
    pub fn set_payment_choice(&mut self, saved_payment_method_id: Option<String>, save_new: bool) -> FlowEffect {
        if saved_payment_method_id == self.saved_payment_method_id && save_new == self.save_payment_method {
            return FlowEffect::None;
        }
        self.saved_payment_method_id = saved_payment_method_id;
        self.save_payment_method = save_new;
        self.discard_transaction();

        if self.step == Step::Payment {
            self.enter_payment()
        } else {
            FlowEffect::None
        }
    }

    /// Retry after an initiation failure
    pub fn retry_initiation(&mut self) -> Result<FlowEffect, FlowError> {
        if !self.can_enter(Step::Payment) {
            return Err(FlowError::StepLocked(Step::Payment));
        }
        Ok(self.enter_payment())
    }

    /// Enter payment; opens a transaction only if none exists or is in flight
    fn enter_payment(&mut self) -> FlowEffect {
        self.step = Step::Payment;
        match self.transaction {
            TransactionState::NotStarted => {
                self.attempts += 1;
                self.transaction = TransactionState::Initiating(self.attempts);
                FlowEffect::Initiate {
                    attempt: self.attempts,
                    request: self.initiate_request(),
                }
            }
            TransactionState::Initiating(_) | TransactionState::Ready(_) => FlowEffect::None,
        }
    }

    fn initiate_request(&self) -> InitiateCheckoutRequest {
        InitiateCheckoutRequest {
            lines: self.cart.lines.clone(),
            contact: self.contact.clone(),
            shipping: self.shipping.clone(),
            notes: self.notes.clone(),
            saved_payment_method_id: self.saved_payment_method_id.clone(),
            save_payment_method: self.save_payment_method,
        }
    }

    fn discard_transaction(&mut self) {
        self.transaction = TransactionState::NotStarted;
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.transaction == TransactionState::Initiating(attempt)
    }

    /// The initiate call for `attempt` returned. Responses for a discarded
    /// or superseded request are dropped; returns whether this one was
    /// accepted.
    pub fn initiation_succeeded(&mut self, attempt: u64, response: InitiateCheckoutResponse) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        self.transaction = TransactionState::Ready(response);
        self.banner = None;
        true
    }

    /// The initiate call for `attempt` failed; stay before payment with a
    /// retryable banner. Failures of superseded requests are dropped.
    pub fn initiation_failed(&mut self, attempt: u64, message: impl Into<String>) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        self.transaction = TransactionState::NotStarted;
        self.banner = Some(message.into());
        self.step = Step::Shipping;
        true
    }

    /// Final submit: persist only the draft key, then hand off to the
    /// processor SDK. The real outcome arrives through the webhook.
    pub fn begin_confirmation(&mut self, slot: &mut dyn DraftKeySlot) -> Result<PaymentHandoff, FlowError> {
        if self.cart.lines.is_empty() {
            return Err(FlowError::EmptyCart);
        }
        if self.step != Step::Payment {
            return Err(FlowError::StepLocked(Step::Payment));
        }
        let TransactionState::Ready(ref ready) = self.transaction else {
            return Err(FlowError::TransactionNotReady);
        };

        slot.store(&ready.draft_key).map_err(FlowError::Slot)?;
        self.banner = None;

        Ok(PaymentHandoff {
            client_secret: ready.client_secret.clone(),
            draft_key: ready.draft_key.clone(),
        })
    }

    /// Same-tab confirmation error (declined card, invalid details). The
    /// shopper retries in place with the same secret and draft key.
    pub fn confirmation_failed(&mut self, message: impl Into<String>) {
        self.banner = Some(message.into());
        self.step = Step::Payment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{RecurringInterval, fixtures};
    use crate::money::Money;
    use crate::wire::TransactionKind;

    fn cart(recurring: bool) -> CartContext {
        CartContext {
            lines: vec![CartLineRequest {
                product_id: "prod_tea".into(),
                price_id: "price_tea".into(),
                name: "Tea".into(),
                quantity: 2,
                unit_price: Some(Money::from_cents(599)),
                recurring,
                interval: recurring.then_some(RecurringInterval::Month),
            }],
        }
    }

    fn contact() -> ContactInfo {
        ContactInfo {
            email: "ada@example.com".into(),
            phone: Some("555-0100".into()),
        }
    }

    fn ready(draft_key: DraftKey) -> InitiateCheckoutResponse {
        InitiateCheckoutResponse {
            client_secret: "pi_1_secret_abc".into(),
            draft_key,
            kind: TransactionKind::Payment,
            amount: Money::from_cents(1198),
        }
    }

    fn attempt(effect: &FlowEffect) -> u64 {
        match effect {
            FlowEffect::Initiate { attempt, .. } => *attempt,
            FlowEffect::None => panic!("expected initiation"),
        }
    }

    /// Flow on the payment step with its first initiation in flight
    fn at_payment() -> (CheckoutFlow, u64) {
        let mut flow = CheckoutFlow::new(cart(false), &AuthContext::guest());
        flow.continue_as_guest().unwrap();
        flow.submit_contact(contact()).unwrap();
        let effect = flow.submit_shipping(fixtures::address(), None).unwrap();
        let first = attempt(&effect);
        (flow, first)
    }

    #[test]
    fn test_guest_walks_all_steps() {
        let mut flow = CheckoutFlow::new(cart(false), &AuthContext::guest());
        assert_eq!(flow.step(), Step::AuthChoice);

        flow.continue_as_guest().unwrap();
        assert_eq!(flow.step(), Step::Contact);

        assert_eq!(flow.submit_contact(contact()).unwrap(), FlowEffect::None);
        assert_eq!(flow.step(), Step::Shipping);

        let effect = flow.submit_shipping(fixtures::address(), Some("leave at door".into())).unwrap();
        assert_eq!(flow.step(), Step::Payment);
        let FlowEffect::Initiate { request, .. } = effect else {
            panic!("expected initiation");
        };
        assert_eq!(request.notes.as_deref(), Some("leave at door"));
        assert_eq!(request.lines.len(), 1);
    }

    #[test]
    fn test_signed_in_skips_auth_and_prefills() {
        let mut profile = UserProfile::new("grace@example.com");
        profile.phone = Some("555-0199".into());
        profile.default_address = Some(fixtures::address());

        let flow = CheckoutFlow::new(cart(true), &AuthContext::signed_in(profile));
        assert_eq!(flow.step(), Step::Contact);
        assert!(flow.is_complete(Step::AuthChoice));
        assert_eq!(flow.contact().email, "grace@example.com");
        assert_eq!(flow.shipping(), &fixtures::address());
    }

    #[test]
    fn test_guest_cannot_buy_subscription() {
        let mut flow = CheckoutFlow::new(cart(true), &AuthContext::guest());
        assert!(flow.continue_as_guest().is_err());
        assert_eq!(flow.step(), Step::AuthChoice);
        assert!(flow.banner().is_some());

        flow.logged_in(&UserProfile::new("ada@example.com"));
        assert_eq!(flow.step(), Step::Contact);
    }

    #[test]
    fn test_invalid_contact_blocks_transition() {
        let mut flow = CheckoutFlow::new(cart(false), &AuthContext::guest());
        flow.continue_as_guest().unwrap();

        let err = flow
            .submit_contact(ContactInfo {
                email: "not-an-email".into(),
                phone: Some(String::new()),
            })
            .unwrap_err();

        assert!(matches!(err, FlowError::Validation(_)));
        assert_eq!(flow.step(), Step::Contact);
        assert!(flow.field_errors().get("email").is_some());
        assert!(flow.field_errors().get("phone").is_some());
    }

    #[test]
    fn test_steps_are_gated() {
        let mut flow = CheckoutFlow::new(cart(false), &AuthContext::guest());
        assert!(matches!(
            flow.submit_contact(contact()),
            Err(FlowError::StepLocked(Step::Contact))
        ));
        assert!(flow.edit(Step::Payment).is_err());
    }

    #[test]
    fn test_transaction_opened_only_once() {
        let (mut flow, first) = at_payment();

        // Re-entering payment while initiation is in flight does nothing
        assert_eq!(flow.retry_initiation().unwrap(), FlowEffect::None);

        let key = DraftKey::generate();
        assert!(flow.initiation_succeeded(first, ready(key)));

        // Going back and resubmitting unchanged data keeps the transaction
        flow.edit(Step::Contact).unwrap();
        assert_eq!(flow.submit_contact(contact()).unwrap(), FlowEffect::None);
        assert_eq!(flow.step(), Step::Payment);
        assert!(flow.is_complete(Step::Payment));
    }

    #[test]
    fn test_changed_data_reopens_transaction() {
        let (mut flow, first) = at_payment();
        flow.initiation_succeeded(first, ready(DraftKey::generate()));

        flow.edit(Step::Shipping).unwrap();
        let mut address = fixtures::address();
        address.line1 = "221B Baker Street".into();

        let effect = flow.submit_shipping(address, None).unwrap();
        assert!(matches!(effect, FlowEffect::Initiate { ref request, .. } if request.shipping.line1 == "221B Baker Street"));
        // Earlier completion is kept
        assert!(flow.is_complete(Step::Contact));
    }

    #[test]
    fn test_duplicate_response_is_dropped() {
        let (mut flow, first) = at_payment();
        assert!(flow.initiation_succeeded(first, ready(DraftKey::generate())));
        assert!(!flow.initiation_succeeded(first, ready(DraftKey::generate())));
    }

    #[test]
    fn test_response_for_edited_shipping_is_dropped() {
        let (mut flow, first) = at_payment();

        // Shipping edited while the first request is still in flight
        flow.edit(Step::Shipping).unwrap();
        let mut address = fixtures::address();
        address.line1 = "1 New Road".into();
        let effect = flow.submit_shipping(address, None).unwrap();
        let second = attempt(&effect);
        assert_ne!(first, second);

        let stale = DraftKey::generate();
        assert!(!flow.initiation_succeeded(first, ready(stale.clone())));
        assert_eq!(flow.transaction(), &TransactionState::Initiating(second));

        let current = DraftKey::generate();
        assert!(flow.initiation_succeeded(second, ready(current.clone())));
        let TransactionState::Ready(ref live) = *flow.transaction() else {
            panic!("expected a ready transaction");
        };
        assert_eq!(live.draft_key, current);
    }

    #[test]
    fn test_stale_failure_does_not_reset_current_request() {
        let (mut flow, first) = at_payment();
        let second = attempt(&flow.set_payment_choice(Some("pm_saved".into()), false));

        assert!(!flow.initiation_failed(first, "timed out"));
        assert_eq!(flow.step(), Step::Payment);
        assert!(flow.banner().is_none());
        assert_eq!(flow.transaction(), &TransactionState::Initiating(second));
    }

    #[test]
    fn test_initiation_failure_is_retryable() {
        let (mut flow, first) = at_payment();
        assert!(flow.initiation_failed(first, "Payment is temporarily unavailable. Please try again."));

        assert_eq!(flow.step(), Step::Shipping);
        assert!(flow.banner().is_some());
        assert!(matches!(flow.retry_initiation().unwrap(), FlowEffect::Initiate { .. }));
        assert_eq!(flow.step(), Step::Payment);
    }

    #[test]
    fn test_confirmation_persists_only_draft_key() {
        let (mut flow, first) = at_payment();
        let key = DraftKey::generate();
        flow.initiation_succeeded(first, ready(key.clone()));

        let mut slot = MemoryDraftKeySlot::default();
        let handoff = flow.begin_confirmation(&mut slot).unwrap();

        assert_eq!(slot.load(), Some(key.clone()));
        assert_eq!(handoff.draft_key, key);
        assert_eq!(handoff.client_secret, "pi_1_secret_abc");
    }

    #[test]
    fn test_confirmation_failure_keeps_transaction() {
        let (mut flow, first) = at_payment();
        let key = DraftKey::generate();
        flow.initiation_succeeded(first, ready(key.clone()));

        let mut slot = MemoryDraftKeySlot::default();
        flow.begin_confirmation(&mut slot).unwrap();
        flow.confirmation_failed("Your card was declined.");

        assert_eq!(flow.step(), Step::Payment);
        assert_eq!(flow.banner(), Some("Your card was declined."));
        let again = flow.begin_confirmation(&mut slot).unwrap();
        assert_eq!(again.draft_key, key);
    }

    #[test]
    fn test_confirmation_requires_ready_transaction() {
        let (mut flow, _) = at_payment();
        let mut slot = MemoryDraftKeySlot::default();
        assert_eq!(
            flow.begin_confirmation(&mut slot).unwrap_err(),
            FlowError::TransactionNotReady
        );
        assert!(slot.load().is_none());
    }
}
