//! Checkout Error Types

use std::future::Future;
use std::time::Duration;

use checkout_core::{FieldErrors, StoreError};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CheckoutError>;

/// Checkout and reconciliation errors
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// Bad or incomplete checkout input
    #[error("Invalid checkout details: {0}")]
    Validation(FieldErrors),

    /// Subscription checkout without a signed-in account
    #[error("Authentication required for subscription checkout")]
    AuthenticationRequired,

    /// A cart line references a missing, inactive or mismatched price
    #[error("Price resolution failed: {0}")]
    PriceResolution(String),

    /// Processor refused to open a payment or setup transaction
    #[error("Transaction could not be opened: {0}")]
    Transaction(String),

    /// Webhook authenticity check failed
    #[error("Webhook signature invalid: {0}")]
    SignatureVerification(String),

    /// Order or subscription creation failed during reconciliation
    #[error("Materialization failed: {0}")]
    Materialization(String),

    /// Draft or commerce store failure
    #[error("Storage error: {0}")]
    Persistence(#[from] StoreError),

    /// Any other processor API failure
    #[error("Stripe error: {0}")]
    Processor(String),

    /// A processor or storage call exceeded its budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CheckoutError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            CheckoutError::Transaction(_)
            | CheckoutError::Processor(_)
            | CheckoutError::Timeout(_)
            | CheckoutError::Materialization(_) => true,
            CheckoutError::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            CheckoutError::Validation(_) => "Please correct the highlighted fields.",
            CheckoutError::AuthenticationRequired => "Please log in to buy a subscription.",
            CheckoutError::PriceResolution(_) => "Some prices in your cart have changed. Please refresh your cart.",
            CheckoutError::Transaction(_) | CheckoutError::Processor(_) | CheckoutError::Timeout(_) => {
                "Payment is temporarily unavailable. Please try again."
            }
            CheckoutError::Config(_) => "Payments are not available right now.",
            _ => "An error occurred processing your request. Please try again.",
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CheckoutError::Validation(_) => "validation_error",
            CheckoutError::AuthenticationRequired => "authentication_required",
            CheckoutError::PriceResolution(_) => "price_resolution_error",
            CheckoutError::Transaction(_) => "transaction_error",
            CheckoutError::SignatureVerification(_) => "signature_verification_error",
            CheckoutError::Materialization(_) => "materialization_failure",
            CheckoutError::Persistence(_) => "persistence_error",
            CheckoutError::Processor(_) => "processor_error",
            CheckoutError::Timeout(_) => "timeout",
            CheckoutError::Config(_) => "config_error",
        }
    }
}

/// Run `fut` with a deadline; expiry becomes [`CheckoutError::Timeout`]
pub(crate) async fn within<T, E, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<CheckoutError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(CheckoutError::Timeout(operation.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_are_actionable() {
        assert!(CheckoutError::AuthenticationRequired.user_message().contains("log in"));
        assert!(
            CheckoutError::PriceResolution("price_1 inactive".into())
                .user_message()
                .contains("refresh")
        );
        assert!(CheckoutError::Timeout("open transaction".into()).user_message().contains("try again"));
    }

    #[test]
    fn test_retryability() {
        assert!(CheckoutError::Transaction("card_declined".into()).is_retryable());
        assert!(!CheckoutError::SignatureVerification("bad".into()).is_retryable());
        assert!(!CheckoutError::Persistence(StoreError::Conflict("draft".into())).is_retryable());
        assert!(CheckoutError::Persistence(StoreError::Backend("down".into())).is_retryable());
    }

    #[tokio::test]
    async fn test_within_deadline() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, CheckoutError>(())
        };
        let err = within(Duration::from_millis(5), "open transaction", slow).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Timeout(ref op) if op == "open transaction"));

        let fast = async { Err::<(), _>(StoreError::Backend("down".into())) };
        let err = within(Duration::from_secs(1), "create draft", fast).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Persistence(_)));
    }
}
