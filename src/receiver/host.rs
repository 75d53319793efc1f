//! Runs one subscription per endpoint over a shared handler registry

use crate::broker::BrokerClient;
use crate::error::{ReceiverError, ReceiverResult};
use crate::receiver::controller::{
    ReceiverSettings, SubscriptionHandle, SubscriptionReceiver, SubscriptionStatus,
};
use crate::receiver::dispatch::{HandlerRegistry, JsonDeserializer, PayloadDeserializer};
use crate::receiver::endpoint::EndpointDescriptor;
use std::sync::Arc;
use tracing::{error, info};

/// Supervises a set of independent subscriptions
pub struct ReceiverHost {
    registry: Arc<HandlerRegistry>,
    deserializer: Arc<dyn PayloadDeserializer>,
    settings: ReceiverSettings,
    subscriptions: Vec<SubscriptionHandle>,
}

impl ReceiverHost {
    /// Freeze `registry` and use JSON payloads
    pub fn new(registry: HandlerRegistry, settings: ReceiverSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            deserializer: Arc::new(JsonDeserializer),
            settings,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_deserializer(mut self, deserializer: Arc<dyn PayloadDeserializer>) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn settings(&self) -> &ReceiverSettings {
        &self.settings
    }

    /// Start consuming `descriptor` through `broker`
    pub fn subscribe<B: BrokerClient>(
        &mut self,
        descriptor: EndpointDescriptor,
        broker: B,
    ) -> ReceiverResult<()> {
        if self
            .subscriptions
            .iter()
            .any(|handle| handle.endpoint() == descriptor.name)
        {
            return Err(ReceiverError::setup(
                &descriptor.name,
                "endpoint is already subscribed",
            ));
        }

        info!(endpoint = %descriptor.name, "Starting subscription");
        let handle = SubscriptionReceiver::start(
            descriptor,
            broker,
            self.registry.clone(),
            self.deserializer.clone(),
            self.settings.clone(),
        );
        self.subscriptions.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Current status of every subscription, in subscription order
    pub fn statuses(&self) -> Vec<(String, SubscriptionStatus)> {
        self.subscriptions
            .iter()
            .map(|handle| (handle.endpoint().to_string(), handle.status()))
            .collect()
    }

    pub fn handle(&self, endpoint: &str) -> Option<&SubscriptionHandle> {
        self.subscriptions
            .iter()
            .find(|handle| handle.endpoint() == endpoint)
    }

    pub fn request_stop(&self) {
        for handle in &self.subscriptions {
            handle.request_stop();
        }
    }

    /// Stop every subscription and wait for all of them
    pub async fn shutdown(self) -> Vec<(String, ReceiverResult<()>)> {
        self.request_stop();

        let mut results = Vec::with_capacity(self.subscriptions.len());
        for handle in self.subscriptions {
            let endpoint = handle.endpoint().to_string();
            let result = handle.await_completion().await;
            if let Err(e) = &result {
                error!(endpoint = %endpoint, error = %e, "Subscription ended with an error");
            }
            results.push((endpoint, result));
        }

        info!(subscriptions = results.len(), "Receiver host shut down");
        results
    }
}
