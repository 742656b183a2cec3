//! Engine configuration.
//!
//! [`StoreConfig`] can be built in code with the `with_*` methods, parsed from
//! TOML, and overridden from the environment:
//!
//! ```toml
//! notification_capacity = 128
//! can_transact_refresh_secs = 300
//!
//! [listener]
//! max_retries = 8
//! initial_backoff_ms = 500
//! max_backoff_ms = 60000
//! backoff_multiplier = 2.0
//! jitter = true
//! ```
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PURCHASE_STATE_NOTIFICATION_CAPACITY` | `notification_capacity` |
//! | `PURCHASE_STATE_CAN_TRANSACT_REFRESH_SECS` | `can_transact_refresh_secs` |
//! | `PURCHASE_STATE_LISTENER_MAX_RETRIES` | `listener.max_retries` |
//! | `PURCHASE_STATE_LISTENER_INITIAL_BACKOFF_MS` | `listener.initial_backoff_ms` |
//! | `PURCHASE_STATE_LISTENER_MAX_BACKOFF_MS` | `listener.max_backoff_ms` |
//!
//! # Example
//!
//! ```
//! use purchase_state_runtime::config::StoreConfig;
//! use std::time::Duration;
//!
//! let config = StoreConfig::default()
//!     .with_notification_capacity(256)
//!     .with_can_transact_refresh_interval(Duration::from_secs(60));
//! assert!(config.validate().is_ok());
//! ```

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PURCHASE_STATE_";

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// An environment override could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidEnvVar {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },
}

/// Transaction listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Resubscription attempts before a transient failure becomes fatal
    pub max_retries: u32,
    /// Backoff before the first resubscription, in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff cap, in milliseconds
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Randomize backoff delays
    pub jitter: bool,
}

impl ListenerConfig {
    /// Retry policy described by this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
            .build()
    }

    /// Validate listener configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::ValidationError(
                "listener.initial_backoff_ms must be > 0".to_string(),
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::ValidationError(
                "listener.max_backoff_ms must be >= initial_backoff_ms".to_string(),
            ));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::ValidationError(
                "listener.backoff_multiplier must be a finite value >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Configuration for a [`StoreState`](crate::StoreState)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Transaction listener settings
    pub listener: ListenerConfig,
    /// Buffered change notifications per subscriber before it lags
    pub notification_capacity: usize,
    /// How often the cached `can_transact` flag is refreshed, in seconds
    pub can_transact_refresh_secs: u64,
}

impl StoreConfig {
    /// Parse a TOML document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] for malformed TOML and
    /// [`ConfigError::ValidationError`] for out-of-range values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `PURCHASE_STATE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] when a variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup (the environment, in
    /// [`StoreConfig::from_env`]).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] when a value does not parse, or
    /// a validation error for the resulting configuration.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            suffix: &str,
        ) -> Result<Option<T>, ConfigError> {
            let var = format!("{ENV_PREFIX}{suffix}");
            lookup(&var)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnvVar { var, value })
                })
                .transpose()
        }

        if let Some(v) = parse(&lookup, "NOTIFICATION_CAPACITY")? {
            self.notification_capacity = v;
        }
        if let Some(v) = parse(&lookup, "CAN_TRANSACT_REFRESH_SECS")? {
            self.can_transact_refresh_secs = v;
        }
        if let Some(v) = parse(&lookup, "LISTENER_MAX_RETRIES")? {
            self.listener.max_retries = v;
        }
        if let Some(v) = parse(&lookup, "LISTENER_INITIAL_BACKOFF_MS")? {
            self.listener.initial_backoff_ms = v;
        }
        if let Some(v) = parse(&lookup, "LISTENER_MAX_BACKOFF_MS")? {
            self.listener.max_backoff_ms = v;
        }

        self.validate()?;
        Ok(self)
    }

    /// Set the notification buffer size
    #[must_use]
    pub const fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Set the `can_transact` refresh interval (whole seconds)
    #[must_use]
    pub const fn with_can_transact_refresh_interval(mut self, interval: Duration) -> Self {
        self.can_transact_refresh_secs = interval.as_secs();
        self
    }

    /// Set the listener configuration
    #[must_use]
    pub const fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    /// Interval between `can_transact` refreshes
    #[must_use]
    pub const fn can_transact_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.can_transact_refresh_secs)
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns error if any section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notification_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "notification_capacity must be > 0".to_string(),
            ));
        }
        if self.can_transact_refresh_secs == 0 {
            return Err(ConfigError::ValidationError(
                "can_transact_refresh_secs must be > 0".to_string(),
            ));
        }
        self.listener.validate()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            notification_capacity: 64,
            can_transact_refresh_secs: 300,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = StoreConfig::from_toml_str(
            r"
            notification_capacity = 8

            [listener]
            max_retries = 2
            jitter = false
            ",
        )
        .unwrap();

        assert_eq!(config.notification_capacity, 8);
        assert_eq!(config.listener.max_retries, 2);
        assert!(!config.listener.jitter);
        assert_eq!(config.can_transact_refresh_secs, 300);
        assert_eq!(config.listener.initial_backoff_ms, 500);
    }

    #[test]
    fn toml_parse_error() {
        let err = StoreConfig::from_toml_str("notification_capacity = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn toml_validation_error() {
        let err = StoreConfig::from_toml_str("notification_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn listener_validation() {
        let mut listener = ListenerConfig::default();
        listener.max_backoff_ms = 10;
        assert!(listener.validate().is_err());

        let mut listener = ListenerConfig::default();
        listener.backoff_multiplier = 0.5;
        assert!(listener.validate().is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PURCHASE_STATE_NOTIFICATION_CAPACITY", "16"),
            ("PURCHASE_STATE_LISTENER_MAX_RETRIES", " 3 "),
        ]
        .into_iter()
        .collect();

        let config = StoreConfig::default()
            .with_overrides(|name| vars.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.notification_capacity, 16);
        assert_eq!(config.listener.max_retries, 3);
    }

    #[test]
    fn env_override_parse_failure_names_variable() {
        let err = StoreConfig::default()
            .with_overrides(|name| {
                (name == "PURCHASE_STATE_CAN_TRANSACT_REFRESH_SECS").then(|| "soon".to_string())
            })
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::InvalidEnvVar {
                var: "PURCHASE_STATE_CAN_TRANSACT_REFRESH_SECS".to_string(),
                value: "soon".to_string(),
            }
        );
    }

    #[test]
    fn retry_policy_from_listener_config() {
        let policy = ListenerConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 8);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert!(policy.jitter);
    }
}
