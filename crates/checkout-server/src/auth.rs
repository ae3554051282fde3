//! Session lookup
//!
//! Accounts and login live outside this service. Requests carry a bearer
//! token that a [`SessionResolver`] maps to a user id; the profile is then
//! read from the commerce store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use checkout_core::{StoreError, UserId, UserProfile};

use crate::error::ApiError;
use crate::state::AppState;

/// Resolves bearer tokens to users
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// `None` for unknown or expired tokens
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, StoreError>;
}

/// In-memory token table (for development/testing)
#[derive(Default)]
pub struct MemorySessions {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: UserId) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), user_id);
        }
    }
}

#[async_trait]
impl SessionResolver for MemorySessions {
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let tokens = self
            .tokens
            .read()
            .map_err(|_| StoreError::Backend("session table lock poisoned".into()))?;
        Ok(tokens.get(token).copied())
    }
}

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn load_user(parts: &Parts, state: &AppState) -> Result<Option<UserProfile>, ApiError> {
    let Some(token) = bearer(parts) else {
        return Ok(None);
    };

    let Some(user_id) = state.sessions.resolve(token).await? else {
        return Err(ApiError::Unauthorized);
    };

    match state.store.user(user_id).await? {
        Some(profile) => Ok(Some(profile)),
        None => {
            tracing::warn!(user_id = %user_id, "Session refers to a missing account");
            Err(ApiError::Unauthorized)
        }
    }
}

/// Signed-in user or guest. A token that no longer resolves is rejected
/// rather than silently downgraded to a guest checkout.
pub struct MaybeUser(pub Option<UserProfile>);

impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        load_user(parts, state).await.map(MaybeUser)
    }
}

/// Requires a signed-in user
pub struct RequireUser(pub UserProfile);

impl FromRequestParts<AppState> for RequireUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        load_user(parts, state)
            .await?
            .map(RequireUser)
            .ok_or(ApiError::Unauthorized)
    }
}
