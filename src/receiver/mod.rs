//! Per-subscription message consumption
//!
//! [`controller`] owns the receive loop, [`retry`] guards each receive,
//! [`dispatch`] routes payloads to typed handlers and [`acknowledgment`]
//! settles every received message exactly once.

pub mod acknowledgment;
pub mod controller;
pub mod dispatch;
pub mod endpoint;
pub mod host;
pub mod retry;

pub use acknowledgment::{AcknowledgmentDecision, AcknowledgmentGateway, DEAD_LETTER_DESCRIPTION};
pub use controller::{
    ReceiveLoop, ReceiverSettings, ReceiverState, SubscriptionHandle, SubscriptionReceiver,
    SubscriptionStatus, DEFAULT_WAIT_TIMEOUT,
};
pub use dispatch::{
    DeserializationError, DispatchOutcome, Dispatcher, HandlerError, HandlerRegistry,
    JsonDeserializer, MessageHandler, PayloadDeserializer, ReceivedMessage,
};
pub use endpoint::{EndpointAttributes, EndpointDescriptor, DEFAULT_ERROR_PAUSE};
pub use host::ReceiverHost;
pub use retry::{ReceiveAttempt, ReceiveExecutor, RetryDecision, RetryPolicy};
