//! HTTP Handlers

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use checkout_core::{DraftKey, Order, StoreError, Subscription};
use checkout_core::wire::{InitiateCheckoutRequest, InitiateCheckoutResponse};
use checkout_payments::{ReconcileOutcome, SIGNATURE_HEADER, SubscriptionAction};
use serde::Serialize;

use crate::auth::{MaybeUser, RequireUser};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stripe_configured: bool,
    pub store: &'static str,
}

/// Browser-side processor settings
#[derive(Debug, Serialize)]
pub struct CheckoutConfigResponse {
    pub publishable_key: Option<String>,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: ReconcileOutcome,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        stripe_configured: state.payments.is_some(),
        store: state.store.backend(),
    })
}

pub async fn checkout_config(State(state): State<AppState>) -> ApiResult<Json<CheckoutConfigResponse>> {
    let payments = state.payments()?;
    Ok(Json(CheckoutConfigResponse {
        publishable_key: payments.publishable_key.clone(),
        currency: state.currency.clone(),
    }))
}

/// Reprice the cart, store the draft and open the processor transaction
pub async fn initiate_checkout(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Json(request): Json<InitiateCheckoutRequest>,
) -> ApiResult<Json<InitiateCheckoutResponse>> {
    let payments = state.payments()?;

    let response = payments.initiator.initiate(user.as_ref(), request).await?;

    tracing::info!(
        draft_key = %response.draft_key,
        kind = response.kind.as_str(),
        amount = %response.amount,
        signed_in = user.is_some(),
        processor = %payments.processor_name,
        "Checkout initiated"
    );

    Ok(Json(response))
}

/// Processor webhook. The body must stay raw for signature verification.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let payments = state.payments()?;

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = payments.reconciler.handle(&body, signature).await?;

    Ok(Json(WebhookAck { received: true, outcome }))
}

/// The caller's subscriptions
pub async fn list_subscriptions(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> ApiResult<Json<Vec<Subscription>>> {
    let payments = state.payments()?;
    Ok(Json(payments.subscriptions.list(user.id).await?))
}

/// Cancel, pause or resume one of the caller's subscriptions
pub async fn subscription_action(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path((external_id, action)): Path<(String, String)>,
) -> ApiResult<Json<Subscription>> {
    let action = SubscriptionAction::parse(&action).ok_or_else(|| not_found("subscription action"))?;
    let payments = state.payments()?;
    let subscription = payments.subscriptions.apply(user.id, &external_id, action).await?;
    Ok(Json(subscription))
}

/// The caller's orders, newest first
pub async fn list_orders(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(state.store.orders_for_user(user.id).await?))
}

/// Order materialized from a checkout draft, for the completion page.
///
/// The draft key is unguessable, so it is enough for a guest order. An order
/// owned by an account is only shown to that account.
pub async fn order_by_draft(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Path(draft_key): Path<String>,
) -> ApiResult<Json<Order>> {
    let key = DraftKey::parse(&draft_key).ok_or_else(|| not_found("order"))?;
    let order = state
        .store
        .order_by_draft_key(&key)
        .await?
        .ok_or_else(|| not_found("order"))?;

    let foreign = order
        .user_id
        .is_some_and(|owner| user.as_ref().is_none_or(|u| u.id != owner));
    if foreign {
        return Err(not_found("order"));
    }

    Ok(Json(order))
}

fn not_found(what: &str) -> ApiError {
    StoreError::NotFound(what.to_string()).into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use checkout_core::{
        ContactInfo, MemoryCommerceStore, MemoryDraftStore, RecurringInterval, ShippingAddress, UserProfile,
    };
    use checkout_core::wire::CartLineRequest;
    use checkout_payments::{CanonicalPrice, MockProcessor, WebhookVerifier};
    use http_body_util::BodyExt;
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::auth::MemorySessions;
    use crate::config::AppConfig;

    const SECRET: &str = "whsec_server_test";
    const TOKEN: &str = "session-grace";

    struct TestApp {
        app: Router,
        processor: Arc<MockProcessor>,
        store: MemoryCommerceStore,
    }

    fn test_app() -> TestApp {
        let processor = Arc::new(
            MockProcessor::new()
                .with_price(CanonicalPrice::one_time("price_tea", 599))
                .with_price(CanonicalPrice::recurring("price_box", 999, RecurringInterval::Month)),
        );
        let store = MemoryCommerceStore::new();
        let sessions = Arc::new(MemorySessions::new());

        let user = UserProfile::new("grace@example.com");
        store.insert_user(user.clone()).unwrap();
        sessions.insert(TOKEN, user.id);

        let config = AppConfig {
            stripe_webhook_secret: Some(SecretString::from(SECRET)),
            stripe_publishable_key: Some("pk_test_1".into()),
            ..AppConfig::default()
        };
        let state = AppState::new(
            &config,
            Arc::new(store.clone()),
            Arc::new(MemoryDraftStore::new()),
            sessions,
            Some(processor.clone()),
        );

        TestApp {
            app: crate::app(state),
            processor,
            store,
        }
    }

    fn checkout_body(price_id: &str) -> Value {
        let line = CartLineRequest {
            product_id: "prod_1".into(),
            price_id: price_id.into(),
            name: "Tea".into(),
            quantity: 1,
            unit_price: None,
            recurring: price_id == "price_box",
            interval: None,
        };
        json!({
            "lines": [line],
            "contact": ContactInfo { email: "grace@example.com".into(), phone: Some("555-0100".into()) },
            "shipping": ShippingAddress {
                name: "Grace Hopper".into(),
                line1: "1 Compiler Court".into(),
                line2: None,
                city: "Arlington".into(),
                state: "VA".into(),
                postal_code: "22201".into(),
                country: "US".into(),
            },
        })
    }

    fn post(uri: &str, body: &Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn webhook(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn signed(body: &[u8]) -> String {
        WebhookVerifier::new(SecretString::from(SECRET))
            .sign(body, chrono::Utc::now().timestamp())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&t.app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stripe_configured"], true);
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_guest_checkout_initiates_payment() {
        let t = test_app();
        let (status, body) = send(&t.app, post("/checkout/initiate", &checkout_body("price_tea"), None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "payment");
        assert_eq!(body["amount"], 599);
        assert!(body["clientSecret"].as_str().unwrap().contains("_secret_"));
        assert!(body["draftKey"].as_str().unwrap().starts_with("drft_"));
    }

    #[tokio::test]
    async fn test_guest_subscription_requires_login() {
        let t = test_app();
        let (status, body) = send(&t.app, post("/checkout/initiate", &checkout_body("price_box"), None)).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "authentication_required");
        assert!(t.processor.opened_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_price_conflicts() {
        let t = test_app();
        let (status, body) = send(&t.app, post("/checkout/initiate", &checkout_body("price_gone"), None)).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "price_resolution_error");
    }

    #[tokio::test]
    async fn test_invalid_shipping_lists_fields() {
        let t = test_app();
        let mut body = checkout_body("price_tea");
        body["shipping"]["city"] = json!("");

        let (status, body) = send(&t.app, post("/checkout/initiate", &body, None)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "validation_error");
        assert!(!body["fields"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_session_rejected() {
        let t = test_app();
        let (status, _) = send(
            &t.app,
            post("/checkout/initiate", &checkout_body("price_tea"), Some("expired")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_signature_required() {
        let t = test_app();
        let body = json!({"id": "evt_1", "type": "invoice.paid", "data": {"object": {}}})
            .to_string()
            .into_bytes();

        let (status, response) = send(&t.app, webhook(body.clone(), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["code"], "signature_verification_error");

        let (status, _) = send(&t.app, webhook(body, Some("t=1,v1=deadbeef".into()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unhandled_event_acknowledged() {
        let t = test_app();
        let body = json!({"id": "evt_1", "type": "charge.refunded", "data": {"object": {"id": "ch_1"}}})
            .to_string()
            .into_bytes();
        let signature = signed(&body);

        let (status, response) = send(&t.app, webhook(body, Some(signature))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_subscription_checkout_end_to_end() {
        let t = test_app();

        let (status, initiated) = send(
            &t.app,
            post("/checkout/initiate", &checkout_body("price_box"), Some(TOKEN)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(initiated["kind"], "setup");

        let metadata = t.processor.opened_transactions()[0].metadata.to_map();
        let event = json!({
            "id": "evt_seti",
            "type": "setup_intent.succeeded",
            "data": {"object": {"id": "seti_1", "metadata": metadata, "payment_method": "pm_card"}}
        })
        .to_string()
        .into_bytes();

        let signature = signed(&event);
        let (status, ack) = send(&t.app, webhook(event.clone(), Some(signature.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"], "processed");

        let (status, ack) = send(&t.app, webhook(event, Some(signature))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"], "already_processed");
        assert_eq!(t.store.all_orders().unwrap().len(), 1);

        let request = Request::builder()
            .uri("/subscriptions")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, subscriptions) = send(&t.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let external_id = subscriptions[0]["external_id"].as_str().unwrap().to_string();

        let uri = format!("/subscriptions/{external_id}/cancel");
        let (status, canceled) = send(&t.app, post(&uri, &json!({}), Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["cancel_at_period_end"], true);

        let (status, _) = send(&t.app, post(&uri, &json!({}), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_foreign_subscription_not_found() {
        let t = test_app();
        let (status, body) = send(&t.app, post("/subscriptions/sub_other/pause", &json!({}), Some(TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    /// Initiate a checkout and deliver the matching success webhook
    async fn complete_checkout(t: &TestApp, price_id: &str, token: Option<&str>) -> String {
        let (status, initiated) = send(&t.app, post("/checkout/initiate", &checkout_body(price_id), token)).await;
        assert_eq!(status, StatusCode::OK);

        let opened = t.processor.opened_transactions();
        let metadata = opened.last().unwrap().metadata.to_map();
        let event = json!({
            "id": "evt_pi",
            "type": "payment_intent.succeeded",
            "data": {"object": {"id": "pi_1", "metadata": metadata}}
        })
        .to_string()
        .into_bytes();
        let (status, ack) = send(&t.app, webhook(event.clone(), Some(signed(&event)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"], "processed");

        initiated["draftKey"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_guest_order_readable_by_draft_key() {
        let t = test_app();
        let draft_key = complete_checkout(&t, "price_tea", None).await;

        let (status, order) = send(&t.app, get(&format!("/orders/by-draft/{draft_key}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["email"], "grace@example.com");
        assert_eq!(order["draft_key"], draft_key.as_str());

        let (status, _) = send(&t.app, get("/orders/by-draft/drft_not-a-key", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_account_order_hidden_from_guests() {
        let t = test_app();
        let draft_key = complete_checkout(&t, "price_tea", Some(TOKEN)).await;
        let uri = format!("/orders/by-draft/{draft_key}");

        let (status, _) = send(&t.app, get(&uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, order) = send(&t.app, get(&uri, Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(order["draft_key"], draft_key.as_str());

        let (status, orders) = send(&t.app, get("/orders", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(orders.as_array().unwrap().len(), 1);

        let (status, _) = send(&t.app, get("/orders", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_subscription_action() {
        let t = test_app();
        let (status, body) = send(&t.app, post("/subscriptions/sub_1/delete", &json!({}), Some(TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_payments_disabled() {
        let state = AppState::new(
            &AppConfig::default(),
            Arc::new(MemoryCommerceStore::new()),
            Arc::new(MemoryDraftStore::new()),
            Arc::new(MemorySessions::new()),
            None,
        );
        let app = crate::app(state);

        let (status, body) = send(&app, post("/checkout/initiate", &checkout_body("price_tea"), None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "payments_disabled");
    }
}
