//! Queue configuration.
//!
//! Process-level settings: where the shared store lives, the key prefix,
//! and the pacing of the tick loop and cron locks. Per-job policy (retries,
//! timeouts, concurrency) belongs to each [`crate::WorkerDefinition`].

use std::time::Duration;

use thiserror::Error;

use crate::store::DEFAULT_PREFIX;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a queue process.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of every store key.
    pub prefix: String,
    /// Time between two scheduling passes.
    pub tick_interval: Duration,
    /// Expiry of the per-fire cron mutex.
    pub cron_lock_ttl: Duration,
    /// How long shutdown waits for running callbacks.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            tick_interval: Duration::from_millis(500),
            cron_lock_ttl: Duration::from_secs(72 * 3600), // 72 hours
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUEUE_REDIS_URL` or `REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `QUEUE_PREFIX`: Key prefix (default: queue:)
    /// - `QUEUE_TICK_INTERVAL_MS`: Tick interval in milliseconds (default: 500)
    /// - `QUEUE_CRON_LOCK_TTL_SECS`: Cron lock expiry in seconds (default: 259200)
    /// - `QUEUE_SHUTDOWN_TIMEOUT_SECS`: Shutdown wait in seconds (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("QUEUE_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = val;
        }

        if let Some(val) = lookup("QUEUE_PREFIX") {
            config.prefix = val;
        }

        if let Some(val) = lookup("QUEUE_TICK_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "QUEUE_TICK_INTERVAL_MS")?;
            config.tick_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("QUEUE_CRON_LOCK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_CRON_LOCK_TTL_SECS")?;
            config.cron_lock_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("QUEUE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUEUE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.cron_lock_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "cron_lock_ttl must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_cron_lock_ttl(mut self, ttl: Duration) -> Self {
        self.cron_lock_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.prefix, "queue:");
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert_eq!(config.cron_lock_ttl, Duration::from_secs(259_200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_redis_url("redis://cache:6380")
            .with_prefix("jobs:")
            .with_tick_interval(Duration::from_millis(100))
            .with_cron_lock_ttl(Duration::from_secs(60));

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.prefix, "jobs:");
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.cron_lock_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://fallback:6379"),
            ("QUEUE_PREFIX", "jobs:"),
            ("QUEUE_TICK_INTERVAL_MS", "250"),
            ("QUEUE_SHUTDOWN_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://fallback:6379");
        assert_eq!(config.prefix, "jobs:");
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_queue_redis_url_takes_priority() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://fallback:6379"),
            ("QUEUE_REDIS_URL", "redis://primary:6379"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://primary:6379");
    }

    #[test]
    fn test_invalid_value() {
        let result = QueueConfig::from_lookup(lookup(&[("QUEUE_TICK_INTERVAL_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "QUEUE_TICK_INTERVAL_MS"
        ));
    }

    #[test]
    fn test_validation_invalid_tick_interval() {
        let config = QueueConfig::default().with_tick_interval(Duration::ZERO);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("tick_interval"));
    }

    #[test]
    fn test_validation_invalid_cron_lock_ttl() {
        let config = QueueConfig::default().with_cron_lock_ttl(Duration::from_millis(500));
        assert!(config.validate().is_err());
    }
}
