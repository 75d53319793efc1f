//! In-process peek-lock queue
//!
//! Mirrors the broker semantics the receive loop relies on: FIFO delivery by
//! sequence number, lock tokens with a lock duration, a broker-maintained
//! delivery count, redelivery after abandon or lock expiry, and a dead-letter
//! sub-queue. Used by the `demo` command and by integration tests.
//!
//! ```rust
//! use bus_receiver::broker::{BrokerClient, InMemoryQueue, ReceiveMode};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let queue = InMemoryQueue::new("orders");
//! queue.send(&b"{\"id\":1}"[..]);
//!
//! let mut client = queue.client(ReceiveMode::PeekLock);
//! let envelope = client.receive(Duration::from_millis(10)).await?.expect("message");
//! assert_eq!(envelope.delivery_count, 1);
//! client.complete(&envelope).await?;
//! assert_eq!(queue.stats().active, 0);
//! # Ok::<(), bus_receiver::broker::BrokerError>(())
//! # });
//! ```

use super::{BrokerClient, BrokerError, InboundEnvelope, ReceiveMode, TYPE_HEADER_NAME};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Reason recorded when the queue itself dead-letters a message
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    message_id: String,
    body: Bytes,
    properties: HashMap<String, Value>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LockedMessage {
    message: StoredMessage,
    locked_until: Instant,
}

/// A message parked in the dead-letter sub-queue
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    pub message_id: String,
    pub body: Bytes,
    pub properties: HashMap<String, Value>,
    pub delivery_count: u32,
    pub reason: String,
    pub description: String,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub locked: usize,
    pub dead_lettered: usize,
    pub completed: u64,
}

#[derive(Debug)]
struct QueueState {
    next_sequence: u64,
    available: BTreeMap<u64, StoredMessage>,
    locked: HashMap<Uuid, LockedMessage>,
    dead_letters: Vec<DeadLetteredMessage>,
    completed: u64,
    lock_duration: Duration,
    max_delivery_count: Option<u32>,
}

impl QueueState {
    /// Return messages whose lock expired to the available set
    fn release_expired_locks(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                debug!(
                    message_id = %locked.message.message_id,
                    "Lock expired, message eligible for redelivery"
                );
                self.available
                    .insert(locked.message.sequence, locked.message);
            }
        }
    }

    fn take_next(&mut self, mode: ReceiveMode, now: Instant) -> Option<InboundEnvelope> {
        self.release_expired_locks(now);

        while let Some((_, mut message)) = self.available.pop_first() {
            message.delivery_count += 1;

            if let Some(max) = self.max_delivery_count {
                if message.delivery_count > max {
                    self.dead_letters.push(DeadLetteredMessage {
                        message_id: message.message_id,
                        body: message.body,
                        properties: message.properties,
                        delivery_count: message.delivery_count - 1,
                        reason: MAX_DELIVERY_COUNT_EXCEEDED.to_string(),
                        description: format!("Message exceeded {max} delivery attempts"),
                    });
                    continue;
                }
            }

            let lock_token = Uuid::new_v4();
            let envelope = InboundEnvelope {
                message_id: message.message_id.clone(),
                lock_token,
                body: message.body.clone(),
                properties: message.properties.clone(),
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at,
            };

            match mode {
                ReceiveMode::PeekLock => {
                    self.locked.insert(
                        lock_token,
                        LockedMessage {
                            message,
                            locked_until: now + self.lock_duration,
                        },
                    );
                }
                ReceiveMode::ReceiveAndDelete => {
                    self.completed += 1;
                }
            }

            return Some(envelope);
        }

        None
    }

    /// Take the lock for `envelope` out of the locked set, failing if it is gone or expired
    fn take_lock(
        &mut self,
        envelope: &InboundEnvelope,
        now: Instant,
    ) -> Result<StoredMessage, BrokerError> {
        let locked = self
            .locked
            .remove(&envelope.lock_token)
            .ok_or_else(|| BrokerError::lock_lost(&envelope.message_id))?;

        if locked.locked_until <= now {
            self.available
                .insert(locked.message.sequence, locked.message);
            return Err(BrokerError::lock_lost(&envelope.message_id));
        }

        Ok(locked.message)
    }
}

#[derive(Debug)]
struct Shared {
    entity_path: String,
    state: Mutex<QueueState>,
    arrivals: Notify,
}

/// Broker-side queue; clones share the same messages
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entity_path: entity_path.into(),
                state: Mutex::new(QueueState {
                    next_sequence: 1,
                    available: BTreeMap::new(),
                    locked: HashMap::new(),
                    dead_letters: Vec::new(),
                    completed: 0,
                    lock_duration: DEFAULT_LOCK_DURATION,
                    max_delivery_count: None,
                }),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Set how long a received message stays locked before redelivery
    pub fn with_lock_duration(self, lock_duration: Duration) -> Self {
        self.state().lock_duration = lock_duration;
        self
    }

    /// Dead-letter messages automatically once they were delivered `max` times
    pub fn with_max_delivery_count(self, max: u32) -> Self {
        self.state().max_delivery_count = Some(max);
        self
    }

    pub fn entity_path(&self) -> &str {
        &self.shared.entity_path
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // State stays consistent across a poisoned lock: every mutation is a single move
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a raw payload, returning the assigned message id
    pub fn send(&self, body: impl Into<Bytes>) -> String {
        self.send_with_properties(body, HashMap::new())
    }

    pub fn send_with_properties(
        &self,
        body: impl Into<Bytes>,
        properties: HashMap<String, Value>,
    ) -> String {
        let message_id = Uuid::new_v4().to_string();
        {
            let mut state = self.state();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.available.insert(
                sequence,
                StoredMessage {
                    sequence,
                    message_id: message_id.clone(),
                    body: body.into(),
                    properties,
                    delivery_count: 0,
                    enqueued_at: Utc::now(),
                },
            );
        }
        self.shared.arrivals.notify_waiters();
        message_id
    }

    /// Serialize `message` as JSON and stamp it with its type discriminator
    pub fn send_json<T: Serialize>(
        &self,
        message_type: &str,
        message: &T,
    ) -> Result<String, serde_json::Error> {
        let body = serde_json::to_vec(message)?;
        let mut properties = HashMap::new();
        properties.insert(
            TYPE_HEADER_NAME.to_string(),
            Value::String(message_type.to_string()),
        );
        Ok(self.send_with_properties(body, properties))
    }

    /// Create a client handle reading from this queue
    pub fn client(&self, mode: ReceiveMode) -> InMemoryClient {
        InMemoryClient {
            queue: self.clone(),
            mode,
            closed: false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        QueueStats {
            active: state.available.len(),
            locked: state.locked.len(),
            dead_lettered: state.dead_letters.len(),
            completed: state.completed,
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.state().dead_letters.clone()
    }

    /// True once nothing is waiting or locked
    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.available.is_empty() && state.locked.is_empty()
    }

    fn try_receive(&self, mode: ReceiveMode) -> Option<InboundEnvelope> {
        self.state().take_next(mode, Instant::now())
    }

    fn settle(&self, envelope: &InboundEnvelope, disposition: Disposition<'_>) -> Result<(), BrokerError> {
        let mut state = self.state();
        let message = match state.take_lock(envelope, Instant::now()) {
            Ok(message) => message,
            Err(e) => {
                // An expired lock puts the message back, so wake long-polling receivers
                drop(state);
                self.shared.arrivals.notify_waiters();
                return Err(e);
            }
        };

        match disposition {
            Disposition::Complete => {
                state.completed += 1;
            }
            Disposition::Abandon => {
                state.available.insert(message.sequence, message);
                drop(state);
                self.shared.arrivals.notify_waiters();
            }
            Disposition::DeadLetter {
                reason,
                description,
            } => {
                state.dead_letters.push(DeadLetteredMessage {
                    message_id: message.message_id,
                    body: message.body,
                    properties: message.properties,
                    delivery_count: message.delivery_count,
                    reason: reason.to_string(),
                    description: description.to_string(),
                });
            }
        }

        Ok(())
    }
}

enum Disposition<'a> {
    Complete,
    Abandon,
    DeadLetter {
        reason: &'a str,
        description: &'a str,
    },
}

/// Exclusive client handle over an [`InMemoryQueue`]
#[derive(Debug)]
pub struct InMemoryClient {
    queue: InMemoryQueue,
    mode: ReceiveMode,
    closed: bool,
}

impl InMemoryClient {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Unavailable(format!(
                "client for {} is closed",
                self.queue.entity_path()
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for InMemoryClient {
    fn entity_path(&self) -> &str {
        self.queue.entity_path()
    }

    fn mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn receive(
        &mut self,
        wait_timeout: Duration,
    ) -> Result<Option<InboundEnvelope>, BrokerError> {
        self.ensure_open()?;
        let deadline = Instant::now() + wait_timeout;

        loop {
            let notified = self.queue.shared.arrivals.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent send cannot slip past us
            notified.as_mut().enable();

            if let Some(envelope) = self.queue.try_receive(self.mode) {
                return Ok(Some(envelope));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Locks may have expired while we waited
                return Ok(self.queue.try_receive(self.mode));
            }
        }
    }

    async fn complete(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queue.settle(envelope, Disposition::Complete)
    }

    async fn abandon(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queue.settle(envelope, Disposition::Abandon)
    }

    async fn dead_letter(
        &mut self,
        envelope: &InboundEnvelope,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.queue.settle(
            envelope,
            Disposition::DeadLetter {
                reason,
                description,
            },
        )
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}
