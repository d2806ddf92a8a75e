use serde::{Deserialize, Serialize};
use std::env;

/// Retry behaviour for outbound federation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts per destination before giving up
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Random jitter applied to each delay, as a fraction of the delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_retries: env::var("FEDERATION_MAX_RETRIES")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(3).clamp(0, 10),
            base_delay_ms: env::var("FEDERATION_RETRY_BASE_DELAY_MS")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(1000),
            max_delay_ms: env::var("FEDERATION_RETRY_MAX_DELAY_MS")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(30000),
            backoff_multiplier: env::var("FEDERATION_RETRY_MULTIPLIER")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(2.0),
            jitter_factor: env::var("FEDERATION_RETRY_JITTER")
                .ok().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.1).clamp(0.0, 1.0),
        }
    }
}

/// Tuning for the history backfill walker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Maximum events requested from a remote in a single backfill call
    pub request_limit: u32,
    /// Maximum backwards extremities attempted per backfill pass
    pub max_extremities: usize,
    /// Per-remote request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            request_limit: 100,
            max_extremities: 5,
            request_timeout_secs: 30,
        }
    }
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        Self {
            request_limit: env::var("BACKFILL_REQUEST_LIMIT")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(100).clamp(1, 500),
            max_extremities: env::var("BACKFILL_MAX_EXTREMITIES")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(5).clamp(1, 20),
            request_timeout_secs: env::var("BACKFILL_TIMEOUT_SECS")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(30),
        }
    }
}

/// Sizing for the event handler's in-process caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the event cache
    pub event_cache_capacity: u64,
    /// Maximum entries in the resolved-state cache
    pub state_cache_capacity: u64,
    /// Cache entry time-to-live in seconds
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_cache_capacity: 10_000,
            state_cache_capacity: 1_000,
            ttl_seconds: 3600,
        }
    }
}

/// Top-level federation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// This server's name, as it appears in user and room identifiers
    pub server_name: String,
    /// Key ID of this server's active signing key, e.g. `ed25519:a_AbCd`
    pub signing_key_id: String,
    /// Maximum missing auth events fetched recursively for one PDU
    pub max_auth_fetch_depth: u32,
    pub retry: RetryConfig,
    pub backfill: BackfillConfig,
    pub cache: CacheConfig,
}

impl FederationConfig {
    pub fn new(server_name: impl Into<String>, signing_key_id: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            signing_key_id: signing_key_id.into(),
            max_auth_fetch_depth: 10,
            retry: RetryConfig::default(),
            backfill: BackfillConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let server_name = env::var("LATTICA_SERVER_NAME")
            .map_err(|_| ConfigError::Missing("LATTICA_SERVER_NAME"))?;
        let signing_key_id = env::var("LATTICA_SIGNING_KEY_ID")
            .map_err(|_| ConfigError::Missing("LATTICA_SIGNING_KEY_ID"))?;

        Ok(Self {
            server_name,
            signing_key_id,
            max_auth_fetch_depth: env::var("FEDERATION_MAX_AUTH_FETCH_DEPTH")
                .ok().and_then(|s| s.parse().ok()).unwrap_or(10).clamp(1, 50),
            retry: RetryConfig::from_env(),
            backfill: BackfillConfig::from_env(),
            cache: CacheConfig::default(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FederationConfig::new("example.org", "ed25519:a_test");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.backfill.max_extremities, 5);
        assert!(config.retry.jitter_factor < 1.0);
    }

    #[test]
    fn env_overrides_are_clamped() {
        env::set_var("FEDERATION_RETRY_JITTER", "7.5");
        env::set_var("FEDERATION_MAX_RETRIES", "99");

        let retry = RetryConfig::from_env();
        assert_eq!(retry.jitter_factor, 1.0);
        assert_eq!(retry.max_retries, 10);

        env::remove_var("FEDERATION_RETRY_JITTER");
        env::remove_var("FEDERATION_MAX_RETRIES");
    }
}
