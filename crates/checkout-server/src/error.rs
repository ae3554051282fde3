//! HTTP error mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout_core::StoreError;
use checkout_core::wire::ErrorResponse;
use checkout_payments::CheckoutError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    /// Missing, unknown or expired session
    #[error("Not signed in")]
    Unauthorized,

    /// Stripe keys are not configured
    #[error("Payments not configured")]
    PaymentsDisabled,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Checkout(CheckoutError::Persistence(err))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::PaymentsDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Checkout(err) => match err {
                CheckoutError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CheckoutError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
                CheckoutError::PriceResolution(_) => StatusCode::CONFLICT,
                CheckoutError::Transaction(_) | CheckoutError::Processor(_) | CheckoutError::Timeout(_) => {
                    StatusCode::BAD_GATEWAY
                }
                CheckoutError::SignatureVerification(_) => StatusCode::BAD_REQUEST,
                CheckoutError::Persistence(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                CheckoutError::Persistence(StoreError::Conflict(_)) => StatusCode::CONFLICT,
                CheckoutError::Materialization(_) | CheckoutError::Persistence(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                CheckoutError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            ApiError::Unauthorized => ErrorResponse {
                error: "Please log in to continue.".into(),
                code: "unauthorized".into(),
                fields: None,
            },
            ApiError::PaymentsDisabled => ErrorResponse {
                error: "Payments are not available right now.".into(),
                code: "payments_disabled".into(),
                fields: None,
            },
            ApiError::Checkout(CheckoutError::Persistence(StoreError::NotFound(_))) => ErrorResponse {
                error: "Not found.".into(),
                code: "not_found".into(),
                fields: None,
            },
            ApiError::Checkout(err) => ErrorResponse {
                error: err.user_message().to_string(),
                code: err.code().to_string(),
                fields: match err {
                    CheckoutError::Validation(fields) => Some(fields.clone()),
                    _ => None,
                },
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
