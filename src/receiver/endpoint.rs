//! Endpoint descriptors: what a subscription consumes and how failures are handled

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pause applied after a failed cycle when the endpoint configures none
pub const DEFAULT_ERROR_PAUSE: Duration = Duration::from_millis(1000);

/// Failure-handling policy attached to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAttributes {
    /// Delivery count at which a failing message stops being abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Dead-letter (true) or drop (false) a message that exhausted its retries
    #[serde(default = "default_dead_letter_after_max_retries")]
    pub dead_letter_after_max_retries: bool,
    /// Pause before the next receive after a failed cycle; 0 selects the 1 s default
    #[serde(default)]
    pub pause_time_if_error_was_thrown_ms: u64,
}

fn default_max_retries() -> u32 {
    10
}

fn default_dead_letter_after_max_retries() -> bool {
    true
}

impl Default for EndpointAttributes {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dead_letter_after_max_retries: default_dead_letter_after_max_retries(),
            pause_time_if_error_was_thrown_ms: 0,
        }
    }
}

impl EndpointAttributes {
    /// Effective pause after a failed cycle
    pub fn error_pause(&self) -> Duration {
        match self.pause_time_if_error_was_thrown_ms {
            0 => DEFAULT_ERROR_PAUSE,
            ms => Duration::from_millis(ms),
        }
    }

    /// Whether a message at this delivery count has used up its retries
    pub fn retries_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_retries
    }
}

/// Immutable description of one subscribed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Queue or topic/subscription path
    pub name: String,
    /// Identifier of the payload type this endpoint carries
    pub message_type: String,
    /// Identifier of the handler registered for the payload type
    pub handler_type: String,
    #[serde(flatten)]
    pub attributes: EndpointAttributes,
}

impl EndpointDescriptor {
    pub fn new(
        name: impl Into<String>,
        message_type: impl Into<String>,
        handler_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            message_type: message_type.into(),
            handler_type: handler_type.into(),
            attributes: EndpointAttributes::default(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.attributes.max_retries = max_retries;
        self
    }

    pub fn with_dead_letter_after_max_retries(mut self, dead_letter: bool) -> Self {
        self.attributes.dead_letter_after_max_retries = dead_letter;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.attributes.pause_time_if_error_was_thrown_ms =
            u64::try_from(pause.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_pause_selects_default() {
        let attributes = EndpointAttributes::default();
        assert_eq!(attributes.error_pause(), Duration::from_millis(1000));
    }

    #[test]
    fn test_configured_pause_is_used() {
        let descriptor = EndpointDescriptor::new("orders", "OrderPlaced", "OrderHandler")
            .with_error_pause(Duration::from_millis(250));
        assert_eq!(descriptor.attributes.error_pause(), Duration::from_millis(250));
    }

    #[test]
    fn test_huge_pause_saturates() {
        let descriptor = EndpointDescriptor::new("orders", "OrderPlaced", "OrderHandler")
            .with_error_pause(Duration::MAX);
        assert_eq!(descriptor.attributes.pause_time_if_error_was_thrown_ms, u64::MAX);

        let just_past = Duration::from_millis(u64::MAX) + Duration::from_secs(1);
        let descriptor = EndpointDescriptor::new("orders", "OrderPlaced", "OrderHandler")
            .with_error_pause(just_past);
        assert_eq!(descriptor.attributes.pause_time_if_error_was_thrown_ms, u64::MAX);
    }

    #[test]
    fn test_retries_exhausted_boundary() {
        let attributes = EndpointAttributes {
            max_retries: 3,
            ..Default::default()
        };
        assert!(!attributes.retries_exhausted(1));
        assert!(!attributes.retries_exhausted(2));
        assert!(attributes.retries_exhausted(3));
        assert!(attributes.retries_exhausted(4));
    }

    #[test]
    fn test_zero_max_retries_exhausts_immediately() {
        let attributes = EndpointAttributes {
            max_retries: 0,
            ..Default::default()
        };
        assert!(attributes.retries_exhausted(1));
    }

    #[test]
    fn test_descriptor_deserializes_flattened_attributes() {
        let toml_content = r#"
name = "orders"
message_type = "OrderPlaced"
handler_type = "OrderHandler"
max_retries = 3
dead_letter_after_max_retries = false
"#;
        let descriptor: EndpointDescriptor = toml::from_str(toml_content).unwrap();
        assert_eq!(descriptor.attributes.max_retries, 3);
        assert!(!descriptor.attributes.dead_letter_after_max_retries);
        assert_eq!(descriptor.attributes.pause_time_if_error_was_thrown_ms, 0);
    }

    #[test]
    fn test_descriptor_defaults_when_attributes_missing() {
        let toml_content = r#"
name = "orders"
message_type = "OrderPlaced"
handler_type = "OrderHandler"
"#;
        let descriptor: EndpointDescriptor = toml::from_str(toml_content).unwrap();
        assert_eq!(descriptor.attributes, EndpointAttributes::default());
    }
}
