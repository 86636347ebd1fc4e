//! Configuration, loaded from TOML with `${ENV_VAR}` substitution.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [consumer]
//! group = "sync-service"
//!
//! [ticketing]
//! base_url = "${SERVICENOW_BASE_URL}"
//! username = "${SERVICENOW_USER}"
//! password = "${SERVICENOW_PASSWORD}"
//! timeout_secs = 30
//! max_retries = 3
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::DEFAULT_CONSUMER_GROUP;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub ticketing: TicketingConfig,
}

/// Redis (event log) configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Consumer group membership.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_group")]
    pub group: String,

    /// Member name; defaults to the hostname at runtime when unset.
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: default_consumer_group(),
            name: None,
        }
    }
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

/// Downstream ticketing API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct TicketingConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Per-attempt timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Present for tuning parity; the backoff schedule is currently
    /// deterministic regardless of this flag.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            jitter: false,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl TicketingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RelayConfig {
    /// Load configuration from the default path or the `RELAY_CONFIG` env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/relay.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;

        info!(
            redis_url = %config.redis.url,
            group = %config.consumer.group,
            ticketing_base_url = %config.ticketing.base_url,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ticketing.base_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "ticketing.base_url must be set".to_string(),
            ));
        }

        if !self.ticketing.base_url.starts_with("http://")
            && !self.ticketing.base_url.starts_with("https://")
        {
            return Err(ConfigError::ValidationError(
                "ticketing.base_url must start with http:// or https://".to_string(),
            ));
        }

        if self.ticketing.base_url.contains("${") {
            warn!(
                base_url = %self.ticketing.base_url,
                "ticketing.base_url contains an unsubstituted environment variable"
            );
        }

        if self.ticketing.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "ticketing.timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("RELAY_TEST_VAR", "substituted_value");
        let input = "url = \"${RELAY_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("RELAY_TEST_VAR");
    }

    #[test]
    fn test_unset_env_var_keeps_placeholder() {
        let input = "url = \"${RELAY_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${RELAY_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let toml = r#"
            [ticketing]
            base_url = "https://dev.service-now.com"
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.consumer.group, "sync-service");
        assert_eq!(config.ticketing.timeout_secs, 30);
        assert_eq!(config.ticketing.max_retries, 3);
        assert!(!config.ticketing.jitter);
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            [redis]
            url = "redis://redis:6379"

            [consumer]
            group = "sync-service-staging"
            name = "worker-1"

            [ticketing]
            base_url = "https://dev.service-now.com"
            username = "admin"
            password = "secret"
            timeout_secs = 10
            max_retries = 5
            jitter = true
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.redis.url, "redis://redis:6379");
        assert_eq!(config.consumer.name.as_deref(), Some("worker-1"));
        assert_eq!(config.ticketing.max_retries, 5);
        assert!(config.ticketing.jitter);
        assert_eq!(config.ticketing.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_base_url_fails_validation() {
        let config = RelayConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_http_base_url_fails_validation() {
        let toml = r#"
            [ticketing]
            base_url = "not-a-url"
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_fails_validation() {
        let toml = r#"
            [ticketing]
            base_url = "https://dev.service-now.com"
            timeout_secs = 0
        "#;

        let config: RelayConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
