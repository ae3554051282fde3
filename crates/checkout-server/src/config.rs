//! Server configuration, read from the environment

use std::str::FromStr;
use std::time::Duration;

use checkout_core::{DEFAULT_DRAFT_TTL, UserId};
use checkout_payments::{CheckoutError, DEFAULT_CALL_TIMEOUT, DEFAULT_TOLERANCE};
use secrecy::SecretString;

#[derive(Debug)]
pub struct AppConfig {
    pub bind_addr: String,

    /// Payments are disabled unless both Stripe secrets are set
    pub stripe_secret_key: Option<SecretString>,
    pub stripe_webhook_secret: Option<SecretString>,

    /// Handed to the browser for Stripe.js
    pub stripe_publishable_key: Option<String>,

    pub currency: String,
    pub draft_ttl: Duration,
    pub processor_timeout: Duration,
    pub webhook_tolerance: Duration,
    pub database_url: Option<SecretString>,

    /// Bearer tokens accepted for signed-in requests, from `SESSION_TOKENS`
    /// (`token=user-uuid` pairs, comma separated)
    pub session_tokens: Vec<(SecretString, UserId)>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_publishable_key: None,
            currency: "usd".into(),
            draft_ttl: DEFAULT_DRAFT_TTL,
            processor_timeout: DEFAULT_CALL_TIMEOUT,
            webhook_tolerance: DEFAULT_TOLERANCE,
            database_url: None,
            session_tokens: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, CheckoutError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CheckoutError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            stripe_secret_key: var("STRIPE_SECRET_KEY").map(SecretString::from),
            stripe_webhook_secret: var("STRIPE_WEBHOOK_SECRET").map(SecretString::from),
            stripe_publishable_key: var("STRIPE_PUBLISHABLE_KEY"),
            currency: var("CHECKOUT_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.currency),
            draft_ttl: seconds("DRAFT_TTL_SECS", var("DRAFT_TTL_SECS"), defaults.draft_ttl)?,
            processor_timeout: seconds(
                "PROCESSOR_TIMEOUT_SECS",
                var("PROCESSOR_TIMEOUT_SECS"),
                defaults.processor_timeout,
            )?,
            webhook_tolerance: seconds(
                "WEBHOOK_TOLERANCE_SECS",
                var("WEBHOOK_TOLERANCE_SECS"),
                defaults.webhook_tolerance,
            )?,
            database_url: var("DATABASE_URL").map(SecretString::from),
            session_tokens: var("SESSION_TOKENS")
                .map(|raw| session_tokens(&raw))
                .transpose()?
                .unwrap_or_default(),
        })
    }

    pub fn payments_configured(&self) -> bool {
        self.stripe_secret_key.is_some() && self.stripe_webhook_secret.is_some()
    }
}

fn seconds(name: &str, value: Option<String>, default: Duration) -> Result<Duration, CheckoutError> {
    match value {
        None => Ok(default),
        Some(raw) => match u64::from_str(raw.trim()) {
            Ok(0) | Err(_) => Err(CheckoutError::Config(format!(
                "{name} must be a positive number of seconds, got {raw:?}"
            ))),
            Ok(secs) => Ok(Duration::from_secs(secs)),
        },
    }
}

fn session_tokens(raw: &str) -> Result<Vec<(SecretString, UserId)>, CheckoutError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let malformed = || CheckoutError::Config("SESSION_TOKENS entries must look like token=user-uuid".into());
            let (token, user_id) = entry.split_once('=').ok_or_else(malformed)?;
            let token = token.trim();
            if token.is_empty() {
                return Err(malformed());
            }
            let user_id = user_id.parse::<UserId>().map_err(|_| malformed())?;
            Ok((SecretString::from(token), user_id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, CheckoutError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.currency, "usd");
        assert_eq!(config.draft_ttl, Duration::from_secs(86_400));
        assert_eq!(config.processor_timeout, Duration::from_secs(10));
        assert_eq!(config.webhook_tolerance, Duration::from_secs(300));
        assert!(!config.payments_configured());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("STRIPE_SECRET_KEY", "sk_test_1"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("CHECKOUT_CURRENCY", "EUR"),
            ("DRAFT_TTL_SECS", "600"),
            ("DATABASE_URL", ""),
        ])
        .unwrap();

        assert!(config.payments_configured());
        assert_eq!(config.stripe_secret_key.unwrap().expose_secret(), "sk_test_1");
        assert_eq!(config.currency, "eur");
        assert_eq!(config.draft_ttl, Duration::from_secs(600));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_bad_number_names_variable() {
        let err = config(&[("PROCESSOR_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, CheckoutError::Config(ref m) if m.contains("PROCESSOR_TIMEOUT_SECS")));
        assert!(config(&[("DRAFT_TTL_SECS", "0")]).is_err());
    }

    #[test]
    fn test_secrets_are_redacted() {
        let config = config(&[
            ("STRIPE_SECRET_KEY", "sk_live_secret"),
            ("SESSION_TOKENS", "tok_private=6f1c2a4e-8b3d-4c5e-9f70-123456789abc"),
        ])
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_live_secret"));
        assert!(!debug.contains("tok_private"));
    }

    #[test]
    fn test_session_tokens() {
        let config = config(&[(
            "SESSION_TOKENS",
            "alpha=6f1c2a4e-8b3d-4c5e-9f70-123456789abc, beta = 0b7e9d1a-2c3f-4a5b-8c6d-7e8f9a0b1c2d,",
        )])
        .unwrap();

        let tokens: Vec<(&str, String)> = config
            .session_tokens
            .iter()
            .map(|(token, user)| (token.expose_secret(), user.to_string()))
            .collect();
        assert_eq!(
            tokens,
            vec![
                ("alpha", "6f1c2a4e-8b3d-4c5e-9f70-123456789abc".to_string()),
                ("beta", "0b7e9d1a-2c3f-4a5b-8c6d-7e8f9a0b1c2d".to_string()),
            ]
        );
        assert!(AppConfig::default().session_tokens.is_empty());
    }

    #[test]
    fn test_malformed_session_tokens() {
        for raw in ["alpha", "=6f1c2a4e-8b3d-4c5e-9f70-123456789abc", "alpha=not-a-uuid"] {
            let err = config(&[("SESSION_TOKENS", raw)]).unwrap_err();
            assert!(matches!(err, CheckoutError::Config(ref m) if m.contains("SESSION_TOKENS")), "{raw}");
        }
    }
}
