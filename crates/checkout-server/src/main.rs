//! Storefront checkout HTTP server
//!
//! Axum server exposing checkout initiation, the payment webhook and
//! subscription self-service. Serves the WASM checkout page from `static/`.

mod auth;
mod config;
mod error;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use checkout_core::{CommerceStore, DraftStore, MemoryCommerceStore, MemoryDraftStore, UserProfile};
use checkout_payments::{PaymentProcessor, StripeProcessor};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use secrecy::ExposeSecret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::MemorySessions;
use crate::config::AppConfig;
use crate::handlers::{
    checkout_config, health_check, initiate_checkout, list_orders, list_subscriptions, order_by_draft,
    payment_webhook, subscription_action,
};
use crate::state::AppState;

/// Build the router over `state`
pub(crate) fn app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))
        // Checkout
        .route("/checkout/config", get(checkout_config))
        .route("/checkout/initiate", post(initiate_checkout))
        // Processor callbacks
        .route("/payments/webhook", post(payment_webhook))
        // Orders
        .route("/orders", get(list_orders))
        .route("/orders/by-draft/{draft_key}", get(order_by_draft))
        // Subscription self-service
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/{id}/{action}", post(subscription_action))
        // Static files (WASM frontend)
        .fallback_service(ServeDir::new("static"))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(feature = "postgres")]
async fn stores(config: &AppConfig) -> anyhow::Result<(Arc<dyn CommerceStore>, Arc<dyn DraftStore>)> {
    use checkout_core::postgres::{PgCommerceStore, PgDraftStore, create_pool, migrate};

    let Some(ref url) = config.database_url else {
        tracing::warn!("DATABASE_URL not set - using in-memory stores");
        return memory_stores(config);
    };

    let pool = create_pool(url.expose_secret()).await?;
    migrate(&pool).await?;
    tracing::info!("✓ Connected to Postgres");

    let drafts = Arc::new(PgDraftStore::new(pool.clone(), config.draft_ttl));

    // Expired drafts are already invisible to reads; this only reclaims space
    let purger = drafts.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
        loop {
            interval.tick().await;
            match purger.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Purged expired drafts"),
                Err(e) => tracing::warn!(error = %e, "Draft purge failed"),
            }
        }
    });

    let store: Arc<dyn CommerceStore> = Arc::new(PgCommerceStore::new(pool));
    let drafts: Arc<dyn DraftStore> = drafts;
    Ok((store, drafts))
}

#[cfg(not(feature = "postgres"))]
async fn stores(config: &AppConfig) -> anyhow::Result<(Arc<dyn CommerceStore>, Arc<dyn DraftStore>)> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored - built without the postgres feature");
    }
    memory_stores(config)
}

/// In-memory stores, with a placeholder account for every configured session
fn memory_stores(config: &AppConfig) -> anyhow::Result<(Arc<dyn CommerceStore>, Arc<dyn DraftStore>)> {
    let memory = MemoryCommerceStore::new();
    for (_, user_id) in &config.session_tokens {
        memory.insert_user(UserProfile {
            id: *user_id,
            ..UserProfile::new(format!("{user_id}@example.com"))
        })?;
    }

    let store: Arc<dyn CommerceStore> = Arc::new(memory);
    let drafts: Arc<dyn DraftStore> = Arc::new(MemoryDraftStore::with_ttl(config.draft_ttl));
    Ok((store, drafts))
}

/// Session table seeded from `SESSION_TOKENS`
fn sessions(config: &AppConfig) -> Arc<MemorySessions> {
    let sessions = Arc::new(MemorySessions::new());
    for (token, user_id) in &config.session_tokens {
        sessions.insert(token.expose_secret(), *user_id);
    }

    if config.session_tokens.is_empty() {
        tracing::warn!("⚠ No SESSION_TOKENS configured - every bearer token will be rejected");
        tracing::warn!("  Signed-in checkout and subscription management are unavailable");
    } else {
        tracing::info!(sessions = config.session_tokens.len(), "✓ Session tokens loaded");
    }
    sessions
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let (store, drafts) = stores(&config).await?;

    // Initialize payments
    let processor: Option<Arc<dyn PaymentProcessor>> = if config.payments_configured() {
        config
            .stripe_secret_key
            .as_ref()
            .map(|key| Arc::new(StripeProcessor::new(key)) as Arc<dyn PaymentProcessor>)
    } else {
        None
    };

    if processor.is_some() {
        tracing::info!("✓ Stripe configured");
    } else {
        tracing::warn!("⚠ Stripe not configured - payments disabled");
        tracing::warn!("  Set STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET in .env");
    }

    // Sessions are issued by the account service; the table is seeded from config
    let sessions = sessions(&config);

    let state = AppState::new(&config, store, drafts, sessions, processor);
    let app = app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 checkout server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                     - Health check");
    tracing::info!("  GET  /checkout/config            - Stripe.js settings");
    tracing::info!("  POST /checkout/initiate          - Open a payment");
    tracing::info!("  POST /payments/webhook           - Stripe events");
    tracing::info!("  GET  /orders                     - List orders");
    tracing::info!("  GET  /orders/by-draft/{{key}}     - Order for a checkout");
    tracing::info!("  GET  /subscriptions              - List subscriptions");
    tracing::info!("  POST /subscriptions/{{id}}/cancel - Cancel at period end");
    tracing::info!("  POST /subscriptions/{{id}}/pause  - Pause collection");
    tracing::info!("  POST /subscriptions/{{id}}/resume - Resume");

    axum::serve(listener, app).await?;

    Ok(())
}
