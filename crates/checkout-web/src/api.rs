//! API Client

use checkout_core::{DraftKey, FieldErrors, Order};
use checkout_core::wire::{ErrorResponse, InitiateCheckoutRequest, InitiateCheckoutResponse};
use serde::Deserialize;

/// Stripe.js settings served by the backend
#[derive(Clone, Debug, Deserialize)]
pub struct CheckoutConfig {
    pub publishable_key: Option<String>,
    pub currency: String,
}

/// A failed API call, ready to show
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiFailure {
    pub message: String,
    pub code: String,
    pub fields: Option<FieldErrors>,
}

impl ApiFailure {
    fn network(err: &reqwest::Error) -> Self {
        Self {
            message: format!("Could not reach the store ({err}). Please try again."),
            code: "network_error".into(),
            fields: None,
        }
    }

    /// Build from an error status and body. Bodies that are not the
    /// server's error shape get a generic message.
    pub fn from_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(err) => Self {
                message: err.error,
                code: err.code,
                fields: err.fields,
            },
            Err(_) => Self {
                message: format!("Request failed ({status}). Please try again."),
                code: "unexpected_response".into(),
                fields: None,
            },
        }
    }
}

fn url(path: &str) -> String {
    let origin = web_sys::window()
        .and_then(|w| w.location().origin().ok())
        .unwrap_or_else(|| "http://localhost:3000".into());
    format!("{origin}{path}")
}

async fn read<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ApiFailure> {
    let status = response.status();
    if status.is_success() {
        response.json().await.map_err(|e| ApiFailure::network(&e))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ApiFailure::from_body(status.as_u16(), &body))
    }
}

pub async fn checkout_config() -> Result<CheckoutConfig, ApiFailure> {
    let response = reqwest::Client::new()
        .get(url("/checkout/config"))
        .send()
        .await
        .map_err(|e| ApiFailure::network(&e))?;
    read(response).await
}

/// Open the processor transaction for the current checkout
pub async fn initiate(
    request: &InitiateCheckoutRequest,
    session_token: Option<&str>,
) -> Result<InitiateCheckoutResponse, ApiFailure> {
    let mut builder = reqwest::Client::new().post(url("/checkout/initiate")).json(request);
    if let Some(token) = session_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(|e| ApiFailure::network(&e))?;
    read(response).await
}

/// The order materialized from `draft_key`; `None` while the webhook has not
/// placed it yet
pub async fn order_for_draft(draft_key: &DraftKey, session_token: Option<&str>) -> Result<Option<Order>, ApiFailure> {
    let mut builder = reqwest::Client::new().get(url(&format!("/orders/by-draft/{draft_key}")));
    if let Some(token) = session_token {
        builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(|e| ApiFailure::network(&e))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    read(response).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_body() {
        let body = r#"{"error":"Please log in to buy a subscription.","code":"authentication_required"}"#;
        let failure = ApiFailure::from_body(401, body);
        assert_eq!(failure.code, "authentication_required");
        assert!(failure.message.contains("log in"));
        assert!(failure.fields.is_none());
    }

    #[test]
    fn test_field_errors_survive() {
        let body = r#"{"error":"Please correct the highlighted fields.","code":"validation_error",
                      "fields":[{"field":"city","message":"City is required"}]}"#;
        let failure = ApiFailure::from_body(422, body);
        assert_eq!(failure.fields.unwrap().get("city"), Some("City is required"));
    }

    #[test]
    fn test_unexpected_body() {
        let failure = ApiFailure::from_body(502, "<html>Bad Gateway</html>");
        assert_eq!(failure.code, "unexpected_response");
        assert!(failure.message.contains("502"));
    }
}
