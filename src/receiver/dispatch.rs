//! Type-driven message dispatch
//!
//! Handlers are registered once against a message type identifier and a
//! handler type identifier. At subscription setup the endpoint descriptor is
//! bound to its registration, producing a [`Dispatcher`] that deserializes,
//! wraps and hands every message to a freshly resolved handler instance without
//! any per-message lookup.

use crate::broker::{InboundEnvelope, TYPE_HEADER_NAME};
use crate::error::ReceiverError;
use crate::receiver::endpoint::EndpointDescriptor;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

/// Error type returned by application handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Payload could not be turned into the endpoint's declared message type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot deserialize payload as {message_type}: {reason}")]
pub struct DeserializationError {
    pub message_type: String,
    pub reason: String,
}

impl DeserializationError {
    pub fn new<T: Into<String>, R: ToString>(message_type: T, reason: R) -> Self {
        Self {
            message_type: message_type.into(),
            reason: reason.to_string(),
        }
    }
}

/// Turns raw payload bytes into a structured value for a declared type
pub trait PayloadDeserializer: Send + Sync {
    fn deserialize(&self, payload: &[u8], message_type: &str)
        -> Result<Value, DeserializationError>;
}

/// JSON payloads via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDeserializer;

impl PayloadDeserializer for JsonDeserializer {
    fn deserialize(
        &self,
        payload: &[u8],
        message_type: &str,
    ) -> Result<Value, DeserializationError> {
        serde_json::from_slice(payload).map_err(|e| DeserializationError::new(message_type, e))
    }
}

/// What a handler receives: the typed body plus the envelope's metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage<M> {
    pub message_id: String,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub body: M,
    /// Sender properties without the reserved type header
    pub properties: HashMap<String, Value>,
}

/// Application handler for one message type
#[async_trait::async_trait]
pub trait MessageHandler<M>: Send + Sync
where
    M: Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage<M>) -> Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<M, H> MessageHandler<M> for Arc<H>
where
    M: Send + 'static,
    H: MessageHandler<M> + ?Sized,
{
    async fn handle(&self, message: ReceivedMessage<M>) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Classified result of dispatching one message
#[derive(Debug)]
pub enum DispatchOutcome {
    Success,
    HandlerFailure(HandlerError),
    DeserializationFailure(DeserializationError),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success)
    }

    /// Failure message used for dead-letter reasons and logs
    pub fn failure_message(&self) -> Option<String> {
        match self {
            DispatchOutcome::Success => None,
            DispatchOutcome::HandlerFailure(e) => Some(e.to_string()),
            DispatchOutcome::DeserializationFailure(e) => Some(e.to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::HandlerFailure(_) => "handler_failure",
            DispatchOutcome::DeserializationFailure(_) => "deserialization_failure",
        }
    }

    /// Surface the underlying fault once the acknowledgment has been decided
    pub fn into_result(self, message_id: &str) -> Result<(), ReceiverError> {
        match self {
            DispatchOutcome::Success => Ok(()),
            DispatchOutcome::HandlerFailure(e) => Err(ReceiverError::handler(message_id, e)),
            DispatchOutcome::DeserializationFailure(e) => Err(ReceiverError::Deserialization(e)),
        }
    }
}

/// Erased binding from a message type to a handler factory
#[async_trait::async_trait]
pub trait DispatchBinding: Send + Sync {
    fn message_type(&self) -> &str;

    async fn dispatch(
        &self,
        value: Value,
        envelope: &InboundEnvelope,
        properties: HashMap<String, Value>,
    ) -> DispatchOutcome;
}

struct TypedBinding<M, H, F> {
    message_type: String,
    factory: F,
    _marker: PhantomData<fn() -> (M, H)>,
}

#[async_trait::async_trait]
impl<M, H, F> DispatchBinding for TypedBinding<M, H, F>
where
    M: DeserializeOwned + Send + 'static,
    H: MessageHandler<M> + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    fn message_type(&self) -> &str {
        &self.message_type
    }

    async fn dispatch(
        &self,
        value: Value,
        envelope: &InboundEnvelope,
        properties: HashMap<String, Value>,
    ) -> DispatchOutcome {
        let body: M = match serde_json::from_value(value) {
            Ok(body) => body,
            Err(e) => {
                return DispatchOutcome::DeserializationFailure(DeserializationError::new(
                    &self.message_type,
                    e,
                ))
            }
        };

        let message = ReceivedMessage {
            message_id: envelope.message_id.clone(),
            delivery_count: envelope.delivery_count,
            enqueued_at: envelope.enqueued_at,
            body,
            properties,
        };

        let handler = (self.factory)();
        match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Success,
            Ok(Err(e)) => DispatchOutcome::HandlerFailure(e),
            Err(panic) => DispatchOutcome::HandlerFailure(panic_message(panic).into()),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// Handler registrations keyed by handler type identifier.
///
/// Built before any subscription starts and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    bindings: HashMap<String, Arc<dyn DispatchBinding>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_types", &self.handler_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler_type` as the handler for `message_type` payloads.
    ///
    /// `factory` is invoked once per message to resolve a handler instance.
    pub fn register<M, H, F>(
        &mut self,
        message_type: impl Into<String>,
        handler_type: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let binding = TypedBinding::<M, H, F> {
            message_type: message_type.into(),
            factory,
            _marker: PhantomData,
        };
        self.bindings.insert(handler_type.into(), Arc::new(binding));
        self
    }

    /// Register a single shared handler instance
    pub fn register_shared<M, H>(
        &mut self,
        message_type: impl Into<String>,
        handler_type: impl Into<String>,
        handler: Arc<H>,
    ) -> &mut Self
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M> + 'static,
    {
        self.register::<M, Arc<H>, _>(message_type, handler_type, move || handler.clone())
    }

    pub fn handler_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Find the binding for a descriptor, checking that it handles the declared message type
    pub fn resolve(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<Arc<dyn DispatchBinding>, ReceiverError> {
        let binding = self.bindings.get(&descriptor.handler_type).ok_or_else(|| {
            ReceiverError::setup(
                &descriptor.name,
                format!("no handler registered as {}", descriptor.handler_type),
            )
        })?;

        if binding.message_type() != descriptor.message_type {
            return Err(ReceiverError::setup(
                &descriptor.name,
                format!(
                    "handler {} accepts {} but endpoint declares {}",
                    descriptor.handler_type,
                    binding.message_type(),
                    descriptor.message_type
                ),
            ));
        }

        Ok(binding.clone())
    }
}

/// Dispatcher bound to one endpoint
#[derive(Clone)]
pub struct Dispatcher {
    message_type: String,
    binding: Arc<dyn DispatchBinding>,
    deserializer: Arc<dyn PayloadDeserializer>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("message_type", &self.message_type)
            .finish()
    }
}

impl Dispatcher {
    /// Resolve the endpoint's binding once
    pub fn bind(
        registry: &HandlerRegistry,
        deserializer: Arc<dyn PayloadDeserializer>,
        descriptor: &EndpointDescriptor,
    ) -> Result<Self, ReceiverError> {
        let binding = registry.resolve(descriptor)?;
        Ok(Self {
            message_type: descriptor.message_type.clone(),
            binding,
            deserializer,
        })
    }

    /// Copy sender properties, leaving out the reserved type header
    pub fn extract_properties(envelope: &InboundEnvelope) -> HashMap<String, Value> {
        envelope
            .properties
            .iter()
            .filter(|(key, _)| key.as_str() != TYPE_HEADER_NAME)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Deserialize, wrap and hand one message to its handler
    pub async fn dispatch(&self, envelope: &InboundEnvelope) -> DispatchOutcome {
        let properties = Self::extract_properties(envelope);

        let value = match self
            .deserializer
            .deserialize(&envelope.body, &self.message_type)
        {
            Ok(value) => value,
            Err(e) => return DispatchOutcome::DeserializationFailure(e),
        };

        self.binding.dispatch(value, envelope, properties).await
    }
}
