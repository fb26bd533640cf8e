use std::{
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid BRIDGE_BIND_ADDR: {0}")]
    InvalidBindAddr(#[from] AddrParseError),
    #[error("invalid BRIDGE_SIGNATURE_TTL_MS: {0}")]
    InvalidSignatureTtlMs(String),
    #[error("invalid BRIDGE_PAIR_TOKEN_TTL_MS: {0}")]
    InvalidPairTokenTtlMs(String),
    #[error("invalid BRIDGE_WAIT_DEFAULT_TIMEOUT_SECS: {0}")]
    InvalidWaitDefaultTimeoutSecs(String),
    #[error("invalid BRIDGE_WAIT_MAX_TIMEOUT_SECS: {0}")]
    InvalidWaitMaxTimeoutSecs(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub build_sha: String,
    pub db_url: Option<String>,
    /// Process-wide fallback HMAC secret, used when a request carries no
    /// workspace id (or the workspace is unknown). Unset means such
    /// requests are rejected.
    pub default_bridge_secret: Option<String>,
    /// Freshness window for signed requests. The nonce registry reuses
    /// this value so a nonce can never outlive its timestamp's validity.
    pub signature_ttl_ms: i64,
    pub pair_token_ttl_ms: i64,
    pub wait_default_timeout_secs: i64,
    pub wait_max_timeout_secs: i64,
    pub fcm_server_key: Option<String>,
    pub apns_key_id: Option<String>,
    pub apns_team_id: Option<String>,
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("BRIDGE_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("BRIDGE_SERVICE_NAME").unwrap_or_else(|_| "bridge".to_string());
        let build_sha = env::var("BRIDGE_BUILD_SHA").unwrap_or_else(|_| "dev".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let default_bridge_secret = optional_env("HMAC_SECRET");
        let signature_ttl_ms = env::var("BRIDGE_SIGNATURE_TTL_MS")
            .unwrap_or_else(|_| "300000".to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidSignatureTtlMs(error.to_string()))?;
        let pair_token_ttl_ms = env::var("BRIDGE_PAIR_TOKEN_TTL_MS")
            .unwrap_or_else(|_| "600000".to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidPairTokenTtlMs(error.to_string()))?;
        let wait_default_timeout_secs = env::var("BRIDGE_WAIT_DEFAULT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "90".to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidWaitDefaultTimeoutSecs(error.to_string()))?;
        let wait_max_timeout_secs = env::var("BRIDGE_WAIT_MAX_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<i64>()
            .map_err(|error| ConfigError::InvalidWaitMaxTimeoutSecs(error.to_string()))?;

        Ok(Self {
            service_name,
            bind_addr,
            build_sha,
            db_url,
            default_bridge_secret,
            signature_ttl_ms,
            pair_token_ttl_ms,
            wait_default_timeout_secs,
            wait_max_timeout_secs,
            fcm_server_key: optional_env("FCM_SERVER_KEY"),
            apns_key_id: optional_env("APNS_KEY_ID"),
            apns_team_id: optional_env("APNS_TEAM_ID"),
        })
    }

    /// Resolves a caller-supplied `timeout` query value into the long-poll
    /// duration: unparseable or non-positive falls back to the default,
    /// and everything is clamped to the configured maximum.
    #[must_use]
    pub fn wait_timeout(&self, requested: Option<&str>) -> Duration {
        let seconds = requested
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(self.wait_default_timeout_secs)
            .min(self.wait_max_timeout_secs)
            .max(1);
        Duration::from_secs(seconds as u64)
    }
}
