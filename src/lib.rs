//! Bus Receiver - per-subscription message consumption
//!
//! Continuously pulls messages from broker endpoints, dispatches each one to a
//! type-matched handler and settles it back to the broker (complete, abandon
//! or dead-letter), surviving transient broker faults and handler failures
//! without letting the receive loop die.
//!
//! # Overview
//!
//! - [`broker`]: the narrow broker client surface and an in-process peek-lock queue
//! - [`receiver`]: typed handler registry, retry executor, acknowledgment policy and
//!   the receive loop controller
//! - [`config`]: TOML configuration of endpoints and receive timing
//! - [`observability`]: structured logging and process-wide metrics
//!
//! # Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use bus_receiver::broker::{InMemoryQueue, ReceiveMode};
//! use bus_receiver::receiver::{
//!     EndpointDescriptor, HandlerError, HandlerRegistry, MessageHandler, ReceivedMessage,
//!     ReceiverHost, ReceiverSettings,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! struct OrderPlacedHandler;
//!
//! #[async_trait]
//! impl MessageHandler<OrderPlaced> for OrderPlacedHandler {
//!     async fn handle(&self, message: ReceivedMessage<OrderPlaced>) -> Result<(), HandlerError> {
//!         println!("order {} placed", message.body.id);
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let mut registry = HandlerRegistry::new();
//! registry.register::<OrderPlaced, _, _>("OrderPlaced", "OrderPlacedHandler", || OrderPlacedHandler);
//!
//! let queue = InMemoryQueue::new("orders");
//! let mut host = ReceiverHost::new(registry, ReceiverSettings::default());
//! host.subscribe(
//!     EndpointDescriptor::new("orders", "OrderPlaced", "OrderPlacedHandler"),
//!     queue.client(ReceiveMode::PeekLock),
//! )?;
//!
//! queue.send(&b"{\"id\": 42}"[..]);
//! host.shutdown().await;
//! # Ok::<(), bus_receiver::ReceiverError>(())
//! # });
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod receiver;
pub mod testing;

pub use broker::{BrokerClient, BrokerError, InboundEnvelope, ReceiveMode};
pub use config::{ConfigError, ReceiverConfig};
pub use error::{ReceiverError, ReceiverResult};
pub use receiver::{
    EndpointDescriptor, HandlerRegistry, MessageHandler, ReceivedMessage, ReceiverHost,
    ReceiverSettings, SubscriptionHandle, SubscriptionReceiver, SubscriptionStatus,
};
