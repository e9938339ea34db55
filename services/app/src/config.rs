//! services/app/src/config.rs
//!
//! Defines the station's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use triage_core::upload::DEFAULT_MAX_UPLOAD_BYTES;
use triage_core::RetryPolicy;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub backend_base_url: String,
    /// Per-request timeout for the inference backend. `None` waits forever.
    pub backend_timeout: Option<Duration>,
    pub report_retry: RetryPolicy,
    pub cors_origin: String,
    pub max_upload_bytes: usize,
    /// Result views untouched for this long are closed.
    pub result_view_idle: Duration,
    /// Open result views beyond this count evict the least recently used.
    pub max_result_views: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Load Server and Database Settings ---
        let bind_address_str =
            var("BIND_ADDRESS").unwrap_or_else(|| "127.0.0.1:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url =
            var("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Inference Backend Settings ---
        let backend_base_url = var("BACKEND_BASE_URL")
            .ok_or_else(|| ConfigError::MissingVar("BACKEND_BASE_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();
        if !(backend_base_url.starts_with("http://") || backend_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "BACKEND_BASE_URL".to_string(),
                format!("'{}' is not an http(s) URL", backend_base_url),
            ));
        }

        let backend_timeout = var("BACKEND_TIMEOUT_SECS")
            .map(|s| parse_number::<u64>("BACKEND_TIMEOUT_SECS", &s))
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let max_attempts = var("REPORT_MAX_ATTEMPTS")
            .map(|s| parse_number::<u32>("REPORT_MAX_ATTEMPTS", &s))
            .transpose()?
            .unwrap_or(3);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "REPORT_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let base_delay_ms = var("REPORT_RETRY_BASE_MS")
            .map(|s| parse_number::<u64>("REPORT_RETRY_BASE_MS", &s))
            .transpose()?
            .unwrap_or(500);

        // --- Load HTTP Surface Settings ---
        let cors_origin =
            var("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".to_string());
        let max_upload_bytes = var("MAX_UPLOAD_BYTES")
            .map(|s| parse_number::<usize>("MAX_UPLOAD_BYTES", &s))
            .transpose()?
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        // --- Load Result View Limits ---
        let result_view_idle_secs = var("RESULT_VIEW_IDLE_SECS")
            .map(|s| parse_number::<u64>("RESULT_VIEW_IDLE_SECS", &s))
            .transpose()?
            .unwrap_or(30 * 60);
        let max_result_views = var("MAX_RESULT_VIEWS")
            .map(|s| parse_number::<usize>("MAX_RESULT_VIEWS", &s))
            .transpose()?
            .unwrap_or(32);
        if max_result_views == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_RESULT_VIEWS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            backend_base_url,
            backend_timeout,
            report_retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
            },
            cors_origin,
            max_upload_bytes,
            result_view_idle: Duration::from_secs(result_view_idle_secs),
            max_result_views,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| {
        ConfigError::InvalidValue(key.to_string(), format!("'{}' is not a valid number", raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/triage"),
        ("BACKEND_BASE_URL", "http://127.0.0.1:8000/"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.bind_address.to_string(), "127.0.0.1:3000");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.backend_base_url, "http://127.0.0.1:8000");
        assert_eq!(config.backend_timeout, None);
        assert_eq!(config.report_retry, RetryPolicy::default());
        assert_eq!(config.cors_origin, "http://localhost:5173");
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.result_view_idle, Duration::from_secs(1800));
        assert_eq!(config.max_result_views, 32);
    }

    #[test]
    fn missing_backend_url_is_reported() {
        let err = Config::from_lookup(lookup(&REQUIRED[..1])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(v) if v == "BACKEND_BASE_URL"));
    }

    #[test]
    fn numeric_settings_are_validated() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("BACKEND_TIMEOUT_SECS", "30"));
        pairs.push(("REPORT_MAX_ATTEMPTS", "5"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.backend_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.report_retry.max_attempts, 5);

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REPORT_MAX_ATTEMPTS", "0"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue(v, _)) if v == "REPORT_MAX_ATTEMPTS"
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_UPLOAD_BYTES", "lots"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("MAX_RESULT_VIEWS", "0"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue(v, _)) if v == "MAX_RESULT_VIEWS"
        ));
    }
}
