//! Error taxonomy for the receive loop
//!
//! Per-message faults (deserialization, handler) are contained by the loop and
//! drive the acknowledgment decision. Broker faults are classified as transient,
//! non-transient or lock-lost. Only setup faults can stop a subscription, and
//! only after its bounded restart budget is spent.

use crate::broker::BrokerError;
use crate::receiver::dispatch::{DeserializationError, HandlerError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for receive loop operations
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Transient broker fault: {0}")]
    TransientBroker(#[source] BrokerError),

    #[error("Non-transient broker fault: {0}")]
    NonTransientBroker(#[source] BrokerError),

    #[error("Message lock lost for message {message_id}")]
    LockLost { message_id: String },

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] DeserializationError),

    #[error("Handler failed for message {message_id}: {source}")]
    Handler {
        message_id: String,
        #[source]
        source: HandlerError,
    },

    #[error("Setup failed for endpoint {endpoint}: {message}")]
    Setup { endpoint: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<BrokerError> for ReceiverError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::LockLost { message_id } => Self::LockLost { message_id },
            error if error.is_transient() => Self::TransientBroker(error),
            error => Self::NonTransientBroker(error),
        }
    }
}

impl ReceiverError {
    /// Create setup error
    pub fn setup<E: Into<String>, S: Into<String>>(endpoint: E, message: S) -> Self {
        Self::Setup {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create handler error
    pub fn handler<S: Into<String>>(message_id: S, source: HandlerError) -> Self {
        Self::Handler {
            message_id: message_id.into(),
            source,
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this fault is tied to a single message rather than the loop
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            ReceiverError::Deserialization(_)
                | ReceiverError::Handler { .. }
                | ReceiverError::LockLost { .. }
        )
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiverError::TransientBroker(_) => "transient_broker",
            ReceiverError::NonTransientBroker(_) => "non_transient_broker",
            ReceiverError::LockLost { .. } => "lock_lost",
            ReceiverError::Deserialization(_) => "deserialization",
            ReceiverError::Handler { .. } => "handler",
            ReceiverError::Setup { .. } => "setup",
            ReceiverError::Config(_) => "config",
            ReceiverError::Internal { .. } => "internal",
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Redact secrets from a failure message and cap its length at `max_len` bytes.
///
/// Used for log fields only; dead-letter reasons keep the handler's message.
pub fn sanitize_error_message(message: &str, max_len: usize) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let sanitized = SENSITIVE_PATH_PATTERN.replace_all(&sanitized, "/***REDACTED***/");
    truncate_error_message(&sanitized, max_len)
}

/// Cap `message` at `max_len` bytes without splitting a UTF-8 character
pub fn truncate_error_message(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }

    let truncate_suffix = "...[truncated]";
    let mut cut = max_len.saturating_sub(truncate_suffix.len());
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &message[..cut], truncate_suffix)
}

/// Result type for receive loop operations
pub type ReceiverResult<T> = Result<T, ReceiverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        let transient: ReceiverError = BrokerError::Timeout("30s".into()).into();
        assert!(matches!(transient, ReceiverError::TransientBroker(_)));

        let fatal: ReceiverError = BrokerError::Unavailable("topic removed".into()).into();
        assert!(matches!(fatal, ReceiverError::NonTransientBroker(_)));

        let lock: ReceiverError = BrokerError::lock_lost("m-1").into();
        assert!(matches!(lock, ReceiverError::LockLost { ref message_id } if message_id == "m-1"));
    }

    #[test]
    fn test_setup_constructor() {
        let error = ReceiverError::setup("orders", "no handler registered");
        assert_eq!(
            error.to_string(),
            "Setup failed for endpoint orders: no handler registered"
        );
        assert_eq!(error.kind(), "setup");
        assert!(!error.is_per_message());
    }

    #[test]
    fn test_handler_error_is_per_message() {
        let error = ReceiverError::handler("m-1", "boom".into());
        assert!(error.is_per_message());
        assert_eq!(error.to_string(), "Handler failed for message m-1: boom");
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456", 500);

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_plain_message_unchanged() {
        assert_eq!(
            sanitize_error_message("order 42 rejected", 500),
            "order 42 rejected"
        );
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message, 500);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_message = "é".repeat(400);
        let sanitized = sanitize_error_message(&long_message, 101);

        assert!(sanitized.len() <= 101);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let message = "Failed to read /home/user/.ssh/id_rsa";
        let sanitized = sanitize_error_message(message, 500);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_truncation_alone_keeps_message_text() {
        assert_eq!(truncate_error_message("invalid key: 42", 500), "invalid key: 42");

        let truncated = truncate_error_message(&"é".repeat(400), 101);
        assert!(truncated.len() <= 101);
        assert!(truncated.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message("", 500), "");
    }
}
