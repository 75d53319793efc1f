//! Receiver configuration
//!
//! One TOML file describes the receive timing shared by every subscription and
//! the list of endpoints to consume.

use crate::receiver::controller::ReceiverSettings;
use crate::receiver::endpoint::EndpointDescriptor;
use crate::receiver::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub receiver: ReceiverSection,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Timing shared by all subscriptions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverSection {
    /// Bounded wait of a single receive in seconds (default: 30)
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    /// Retries of transient receive faults
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Restarts of failing subscription setup
    #[serde(default = "RetryPolicy::setup_default")]
    pub setup: RetryPolicy,
}

fn default_wait_timeout() -> u64 {
    30
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_wait_timeout(),
            retry: RetryPolicy::default(),
            setup: RetryPolicy::setup_default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid endpoint name: {0}")]
    InvalidEndpointName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ReceiverConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ReceiverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver.wait_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "receiver.wait_timeout_secs must be greater than 0".to_string(),
            ));
        }
        self.receiver
            .retry
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("receiver.retry: {e}")))?;
        self.receiver
            .setup
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("receiver.setup: {e}")))?;

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            validate_endpoint_name(&endpoint.name)?;
            if !seen.insert(endpoint.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "endpoint '{}' is declared more than once",
                    endpoint.name
                )));
            }
            if endpoint.message_type.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "endpoint '{}' has an empty message_type",
                    endpoint.name
                )));
            }
            if endpoint.handler_type.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "endpoint '{}' has an empty handler_type",
                    endpoint.name
                )));
            }
        }

        Ok(())
    }

    /// Settings handed to every subscription
    pub fn settings(&self) -> ReceiverSettings {
        ReceiverSettings {
            wait_timeout: Duration::from_secs(self.receiver.wait_timeout_secs),
            retry: self.receiver.retry.clone(),
            setup: self.receiver.setup.clone(),
        }
    }

    pub fn descriptors(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[receiver]
wait_timeout_secs = 1

[[endpoints]]
name = "orders"
message_type = "OrderPlaced"
handler_type = "OrderPlacedHandler"
max_retries = 3
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Endpoint names are queue or topic/subscription paths: [a-zA-Z0-9._/-]+
fn validate_endpoint_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));

    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidEndpointName(format!(
            "Endpoint name '{name}' must match pattern [a-zA-Z0-9._/-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[receiver]
wait_timeout_secs = 10

[receiver.retry]
max_attempts = 5
initial_delay_ms = 50
max_delay_ms = 1000

[receiver.setup]
max_attempts = 20
initial_delay_ms = 200
max_delay_ms = 10000

[[endpoints]]
name = "orders"
message_type = "OrderPlaced"
handler_type = "OrderPlacedHandler"
max_retries = 5
dead_letter_after_max_retries = false
pause_time_if_error_was_thrown_ms = 250

[[endpoints]]
name = "billing/subscriptions/invoices"
message_type = "InvoiceIssued"
handler_type = "InvoiceHandler"
"#;

        let config = ReceiverConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.endpoints.len(), 2);

        let settings = config.settings();
        assert_eq!(settings.wait_timeout, Duration::from_secs(10));
        assert_eq!(settings.retry, RetryPolicy::new(5, 50, 1000));
        assert_eq!(settings.setup, RetryPolicy::new(20, 200, 10000));

        let orders = &config.descriptors()[0];
        assert_eq!(orders.attributes.max_retries, 5);
        assert!(!orders.attributes.dead_letter_after_max_retries);
        assert_eq!(orders.attributes.error_pause(), Duration::from_millis(250));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ReceiverConfig::from_toml_str("").unwrap();
        assert!(config.endpoints.is_empty());

        let settings = config.settings();
        assert_eq!(settings, ReceiverSettings::default());
        assert_eq!(settings.wait_timeout, Duration::from_secs(30));
        assert_eq!(settings.setup.max_attempts, 100);
    }

    #[test]
    fn test_partial_retry_section_fills_defaults() {
        let config = ReceiverConfig::from_toml_str(
            r#"
[receiver.retry]
max_attempts = 7
"#,
        )
        .unwrap();
        assert_eq!(config.receiver.retry, RetryPolicy::new(7, 100, 5000));
    }

    #[test]
    fn test_invalid_endpoint_name() {
        assert!(validate_endpoint_name("orders@prod").is_err());
        assert!(validate_endpoint_name("").is_err());
        assert!(validate_endpoint_name("topic/subscriptions/sub-1.v2_a").is_ok());
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let toml_content = r#"
[[endpoints]]
name = "orders"
message_type = "A"
handler_type = "H"

[[endpoints]]
name = "orders"
message_type = "B"
handler_type = "H"
"#;
        let error = ReceiverConfig::from_toml_str(toml_content).unwrap_err();
        assert!(error.to_string().contains("more than once"));
    }

    #[test]
    fn test_empty_handler_type_rejected() {
        let toml_content = r#"
[[endpoints]]
name = "orders"
message_type = "OrderPlaced"
handler_type = " "
"#;
        assert!(matches!(
            ReceiverConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_wait_timeout_rejected() {
        let result = ReceiverConfig::from_toml_str("[receiver]\nwait_timeout_secs = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let toml_content = r#"
[receiver.retry]
initial_delay_ms = 9000
max_delay_ms = 10
"#;
        let error = ReceiverConfig::from_toml_str(toml_content).unwrap_err();
        assert!(error.to_string().contains("receiver.retry"));
    }

    #[test]
    fn test_test_config() {
        let config = ReceiverConfig::test_config();
        assert_eq!(config.descriptors()[0].name, "orders");
        assert_eq!(config.settings().wait_timeout, Duration::from_secs(1));
    }
}
