//! Broker client abstraction consumed by the receive loop
//!
//! The broker transport itself (connections, lock leasing, storage and
//! redelivery) is owned by the broker. This module only defines the narrow
//! surface the receive loop needs: a bounded-wait receive, the three
//! lock-releasing acknowledgments, and a fault classification.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;

pub use memory::{InMemoryClient, InMemoryQueue, QueueStats};

/// Reserved property carrying the sender's type discriminator.
/// It is never copied into the handler-visible property map.
pub const TYPE_HEADER_NAME: &str = "type";

/// Broker delivery mode for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Message is locked on receive and must be completed, abandoned or dead-lettered
    PeekLock,
    /// Message is removed on receive (at-most-once); no acknowledgment is made
    ReceiveAndDelete,
}

impl ReceiveMode {
    /// Whether received messages hold a broker-side lock that must be released
    pub fn requires_acknowledgment(&self) -> bool {
        matches!(self, ReceiveMode::PeekLock)
    }
}

/// A message received from the broker, tied to one broker-side lock
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message_id: String,
    pub lock_token: Uuid,
    pub body: Bytes,
    pub properties: HashMap<String, Value>,
    /// Broker-maintained, starts at 1 on first delivery
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl InboundEnvelope {
    pub fn new(message_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: message_id.into(),
            lock_token: Uuid::new_v4(),
            body: body.into(),
            properties: HashMap::new(),
            delivery_count: 1,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Type discriminator set by the sender, if any
    pub fn declared_type(&self) -> Option<&str> {
        self.properties.get(TYPE_HEADER_NAME).and_then(Value::as_str)
    }
}

/// Faults reported by a broker client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Broker operation timed out: {0}")]
    Timeout(String),
    #[error("Transient connection fault: {0}")]
    TransientConnection(String),
    #[error("Broker is busy: {0}")]
    ServerBusy(String),
    #[error("Message lock lost for message {message_id}")]
    LockLost { message_id: String },
    #[error("Messaging entity unavailable: {0}")]
    Unavailable(String),
    #[error("Broker protocol violation: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Faults that are likely to succeed when the same call is retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::TransientConnection(_) | BrokerError::ServerBusy(_)
        )
    }

    /// Faults an acknowledgment call may absorb. The broker will redeliver the
    /// message after lock expiry, so only protocol violations escape.
    pub fn is_tolerated_on_acknowledge(&self) -> bool {
        !matches!(self, BrokerError::Protocol(_))
    }

    pub fn lock_lost<S: Into<String>>(message_id: S) -> Self {
        Self::LockLost {
            message_id: message_id.into(),
        }
    }
}

/// Client handle for one subscription.
///
/// A handle is owned exclusively by one receive loop, hence `&mut self`
/// everywhere. Implementations only need to be `Send`.
#[async_trait::async_trait]
pub trait BrokerClient: Send + 'static {
    /// Queue or topic/subscription path this client reads from
    fn entity_path(&self) -> &str;

    /// Delivery mode of this client
    fn mode(&self) -> ReceiveMode;

    /// Prepare the client before the first receive
    async fn open(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Wait up to `wait_timeout` for one message; `Ok(None)` when none arrived
    async fn receive(
        &mut self,
        wait_timeout: Duration,
    ) -> Result<Option<InboundEnvelope>, BrokerError>;

    /// Remove the message permanently
    async fn complete(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError>;

    /// Release the lock, making the message immediately redeliverable
    async fn abandon(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError>;

    /// Move the message to the dead-letter sub-queue
    async fn dead_letter(
        &mut self,
        envelope: &InboundEnvelope,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError>;

    /// Release client resources after the loop terminates
    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Timeout("t".into()).is_transient());
        assert!(BrokerError::TransientConnection("c".into()).is_transient());
        assert!(BrokerError::ServerBusy("b".into()).is_transient());
        assert!(!BrokerError::lock_lost("m").is_transient());
        assert!(!BrokerError::Unavailable("gone".into()).is_transient());
        assert!(!BrokerError::Protocol("bad".into()).is_transient());
    }

    #[test]
    fn test_only_protocol_errors_escape_acknowledgment() {
        assert!(BrokerError::lock_lost("m").is_tolerated_on_acknowledge());
        assert!(BrokerError::Unavailable("gone".into()).is_tolerated_on_acknowledge());
        assert!(BrokerError::Timeout("t".into()).is_tolerated_on_acknowledge());
        assert!(!BrokerError::Protocol("bad".into()).is_tolerated_on_acknowledge());
    }

    #[test]
    fn test_envelope_builders() {
        let envelope = InboundEnvelope::new("msg-1", &b"{}"[..])
            .with_property(TYPE_HEADER_NAME, "OrderPlaced")
            .with_property("tenant", "acme")
            .with_delivery_count(4);

        assert_eq!(envelope.message_id, "msg-1");
        assert_eq!(envelope.delivery_count, 4);
        assert_eq!(envelope.declared_type(), Some("OrderPlaced"));
        assert_eq!(envelope.properties.len(), 2);
    }

    #[test]
    fn test_receive_mode_acknowledgment() {
        assert!(ReceiveMode::PeekLock.requires_acknowledgment());
        assert!(!ReceiveMode::ReceiveAndDelete.requires_acknowledgment());
    }

    #[test]
    fn test_lock_lost_display() {
        let error = BrokerError::lock_lost("abc");
        assert_eq!(error.to_string(), "Message lock lost for message abc");
    }
}
