//! Receive loop controller
//!
//! Each subscription runs one [`ReceiveLoop`] on its own task:
//! receive, dispatch, decide, acknowledge, repeat until stop is requested.
//! Messages of one subscription are processed strictly one at a time.
//!
//! Before the loop starts, setup (handler binding and broker open) is retried
//! with backoff up to a bounded number of attempts. Exhausting that budget is
//! the only way a subscription stops on its own, and it is logged at error
//! level, counted, and published as [`SubscriptionStatus::SetupFailed`].

use crate::broker::{BrokerClient, InboundEnvelope};
use crate::error::{sanitize_error_message, ReceiverError, ReceiverResult};
use crate::observability::metrics;
use crate::receiver::acknowledgment::{AcknowledgmentDecision, AcknowledgmentGateway};
use crate::receiver::dispatch::{
    DispatchOutcome, Dispatcher, HandlerRegistry, PayloadDeserializer,
};
use crate::receiver::endpoint::EndpointDescriptor;
use crate::receiver::retry::{
    interruptible_sleep, is_stop_requested, ReceiveAttempt, ReceiveExecutor, RetryDecision,
    RetryPolicy,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Default bounded wait for a single receive
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest processing failure written to a log line
const MAX_LOGGED_ERROR_LEN: usize = 1024;

/// Timing knobs shared by every subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub wait_timeout: Duration,
    /// Internal retries of transient receive faults
    pub retry: RetryPolicy,
    /// Restarts of a failing subscription setup
    pub setup: RetryPolicy,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            retry: RetryPolicy::default(),
            setup: RetryPolicy::setup_default(),
        }
    }
}

/// Observable state of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Starting { attempt: u32 },
    Running,
    Stopping,
    Completed,
    SetupFailed { attempts: u32, reason: String },
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Completed | SubscriptionStatus::SetupFailed { .. }
        )
    }
}

/// Per-subscription state owned by its loop
pub struct ReceiverState<B> {
    pub broker: B,
    pub shutdown_rx: watch::Receiver<bool>,
    pub descriptor: EndpointDescriptor,
}

impl<B: BrokerClient> ReceiverState<B> {
    pub fn new(broker: B, shutdown_rx: watch::Receiver<bool>, descriptor: EndpointDescriptor) -> Self {
        Self {
            broker,
            shutdown_rx,
            descriptor,
        }
    }

    fn stop_requested(&self) -> bool {
        is_stop_requested(&self.shutdown_rx)
    }
}

/// The receive, dispatch, acknowledge cycle of one subscription
pub struct ReceiveLoop<B> {
    state: ReceiverState<B>,
    dispatcher: Dispatcher,
    executor: ReceiveExecutor,
    wait_timeout: Duration,
    last_attempt_was_error: bool,
}

impl<B: BrokerClient> ReceiveLoop<B> {
    pub fn new(state: ReceiverState<B>, dispatcher: Dispatcher, settings: &ReceiverSettings) -> Self {
        Self {
            state,
            dispatcher,
            executor: ReceiveExecutor::new(settings.retry.clone()),
            wait_timeout: settings.wait_timeout,
            last_attempt_was_error: false,
        }
    }

    /// Run until stop is requested, then hand the state back for teardown
    pub async fn run(mut self) -> ReceiverState<B> {
        let endpoint = self.state.descriptor.name.clone();

        loop {
            if self.state.stop_requested() {
                break;
            }

            if self.last_attempt_was_error {
                self.last_attempt_was_error = false;
                let pause = self.state.descriptor.attributes.error_pause();
                debug!(pause_ms = pause.as_millis() as u64, "Pausing after failed cycle");
                if !interruptible_sleep(&self.state.shutdown_rx, pause).await {
                    break;
                }
            }

            let attempt = self
                .executor
                .receive(
                    &mut self.state.broker,
                    self.wait_timeout,
                    &self.state.shutdown_rx,
                )
                .await;

            match attempt {
                ReceiveAttempt::Cancelled => break,
                ReceiveAttempt::Empty => {
                    metrics().empty_receive();
                }
                ReceiveAttempt::Failed(e) => {
                    warn!(
                        error = %e,
                        transient = e.is_transient(),
                        "Receive failed, pausing before next attempt"
                    );
                    metrics().receive_failed(&endpoint);
                    self.last_attempt_was_error = true;
                }
                ReceiveAttempt::Received(envelope) => {
                    metrics().message_received(&endpoint);

                    if self.state.stop_requested() {
                        self.release_on_stop(&envelope).await;
                        break;
                    }

                    if let Err(e) = self.process(&envelope).await {
                        if e.is_per_message() {
                            warn!(
                                message_id = %envelope.message_id,
                                error = %sanitize_error_message(&e.to_string(), MAX_LOGGED_ERROR_LEN),
                                kind = e.kind(),
                                "Message processing failed"
                            );
                        } else {
                            error!(
                                message_id = %envelope.message_id,
                                error = %e,
                                kind = e.kind(),
                                "Acknowledgment failed with a broker protocol error"
                            );
                        }
                        self.last_attempt_was_error = true;
                    }
                }
            }
        }

        debug!("Receive loop observed stop request");
        self.state
    }

    /// Dispatch one message and settle it.
    ///
    /// The acknowledgment is always applied before the dispatch fault is
    /// returned; a processing failure is reported even when the settle call
    /// succeeded.
    async fn process(&mut self, envelope: &InboundEnvelope) -> ReceiverResult<()> {
        let span = crate::message_span!(
            message_id = %envelope.message_id,
            delivery_count = envelope.delivery_count
        );

        async {
            let endpoint = self.state.descriptor.name.as_str();
            let started = Instant::now();
            let outcome = self.dispatcher.dispatch(envelope).await;
            let elapsed = started.elapsed();

            match &outcome {
                DispatchOutcome::Success => metrics().dispatch_succeeded(endpoint, elapsed),
                DispatchOutcome::HandlerFailure(_) => metrics().handler_failed(endpoint, elapsed),
                DispatchOutcome::DeserializationFailure(_) => {
                    metrics().deserialization_failed(endpoint)
                }
            }

            let decision = AcknowledgmentDecision::decide(
                &outcome,
                envelope.delivery_count,
                &self.state.descriptor.attributes,
            );

            let mut acknowledgment_error = None;
            if self.state.broker.mode().requires_acknowledgment() {
                match AcknowledgmentGateway::apply(&mut self.state.broker, envelope, &decision)
                    .await
                {
                    Ok(true) => record_decision(endpoint, &outcome, &decision),
                    Ok(false) => {}
                    Err(e) => acknowledgment_error = Some(e),
                }
            } else {
                debug!("Receive-and-delete mode, message already removed by broker");
            }

            info!(
                outcome = outcome.label(),
                decision = decision.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Message handled"
            );

            match (outcome.into_result(&envelope.message_id), acknowledgment_error) {
                (Err(processing), Some(ack)) => {
                    error!(error = %ack, "Acknowledgment failed with a broker protocol error");
                    Err(processing)
                }
                (Err(processing), None) => Err(processing),
                (Ok(()), Some(ack)) => Err(ack.into()),
                (Ok(()), None) => Ok(()),
            }
        }
        .instrument(span)
        .await
    }

    /// Stop observed with a message in hand: give the lock back untouched
    async fn release_on_stop(&mut self, envelope: &InboundEnvelope) {
        info!(
            message_id = %envelope.message_id,
            "Stop requested after receive, abandoning message without dispatch"
        );

        if !self.state.broker.mode().requires_acknowledgment() {
            return;
        }

        match AcknowledgmentGateway::abandon(&mut self.state.broker, envelope).await {
            Ok(true) => metrics().message_abandoned(),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Abandon on stop failed with a broker protocol error"),
        }
    }
}

fn record_decision(endpoint: &str, outcome: &DispatchOutcome, decision: &AcknowledgmentDecision) {
    match decision {
        AcknowledgmentDecision::Complete if outcome.is_success() => metrics().message_completed(),
        AcknowledgmentDecision::Complete => metrics().message_dropped(endpoint),
        AcknowledgmentDecision::Abandon => metrics().message_abandoned(),
        AcknowledgmentDecision::DeadLetter { .. } => metrics().message_dead_lettered(endpoint),
    }
}

/// Starts subscriptions
pub struct SubscriptionReceiver;

impl SubscriptionReceiver {
    /// Spawn the receive loop for `descriptor` on the current runtime
    pub fn start<B: BrokerClient>(
        descriptor: EndpointDescriptor,
        broker: B,
        registry: Arc<HandlerRegistry>,
        deserializer: Arc<dyn PayloadDeserializer>,
        settings: ReceiverSettings,
    ) -> SubscriptionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Starting { attempt: 0 });
        let endpoint = descriptor.name.clone();

        let span = crate::subscription_span!(
            endpoint = %descriptor.name,
            message_type = %descriptor.message_type,
            mode = ?broker.mode()
        );
        let state = ReceiverState::new(broker, shutdown_rx, descriptor);
        let task = tokio::spawn(
            supervise(state, registry, deserializer, settings, status_tx).instrument(span),
        );

        SubscriptionHandle {
            endpoint,
            shutdown_tx,
            status_rx,
            task,
        }
    }
}

/// Bind the dispatcher and open the broker client
async fn setup<B: BrokerClient>(
    state: &mut ReceiverState<B>,
    registry: &HandlerRegistry,
    deserializer: Arc<dyn PayloadDeserializer>,
) -> ReceiverResult<Dispatcher> {
    let dispatcher = Dispatcher::bind(registry, deserializer, &state.descriptor)?;
    state
        .broker
        .open()
        .await
        .map_err(|e| ReceiverError::setup(&state.descriptor.name, e.to_string()))?;
    Ok(dispatcher)
}

async fn supervise<B: BrokerClient>(
    mut state: ReceiverState<B>,
    registry: Arc<HandlerRegistry>,
    deserializer: Arc<dyn PayloadDeserializer>,
    settings: ReceiverSettings,
    status_tx: watch::Sender<SubscriptionStatus>,
) -> ReceiverResult<()> {
    let endpoint = state.descriptor.name.clone();
    let mut attempts = 0u32;

    let dispatcher = loop {
        if state.stop_requested() {
            info!("Stop requested before setup finished");
            close_broker(&mut state).await;
            status_tx.send_replace(SubscriptionStatus::Completed);
            return Ok(());
        }

        attempts += 1;
        status_tx.send_replace(SubscriptionStatus::Starting { attempt: attempts });
        metrics().setup_attempted();

        let error = match setup(&mut state, &registry, deserializer.clone()).await {
            Ok(dispatcher) => break dispatcher,
            Err(e) => e,
        };

        match settings.setup.next_attempt(attempts, state.stop_requested()) {
            RetryDecision::Proceed { attempt, delay_ms } => {
                warn!(
                    error = %error,
                    attempt,
                    max_attempts = settings.setup.max_attempts,
                    delay_ms,
                    "Subscription setup failed, restarting"
                );
                // A stop during the delay is picked up at the top of the loop
                interruptible_sleep(&state.shutdown_rx, Duration::from_millis(delay_ms)).await;
            }
            RetryDecision::AbortShutdownRequested => {
                info!(error = %error, "Stop requested while setup was failing");
                close_broker(&mut state).await;
                status_tx.send_replace(SubscriptionStatus::Completed);
                return Ok(());
            }
            RetryDecision::AbortMaxAttemptsExceeded => {
                let reason = error.to_string();
                error!(
                    attempts,
                    reason = %reason,
                    "Subscription setup failed permanently, endpoint is no longer consumed"
                );
                metrics().setup_gave_up(&endpoint);
                close_broker(&mut state).await;
                status_tx.send_replace(SubscriptionStatus::SetupFailed {
                    attempts,
                    reason: reason.clone(),
                });
                return Err(ReceiverError::setup(
                    endpoint,
                    format!("gave up after {attempts} attempts: {reason}"),
                ));
            }
        }
    };

    info!(attempts, "Subscription running");
    status_tx.send_replace(SubscriptionStatus::Running);
    metrics().subscription_started();

    let mut state = ReceiveLoop::new(state, dispatcher, &settings).run().await;

    status_tx.send_replace(SubscriptionStatus::Stopping);
    close_broker(&mut state).await;
    metrics().subscription_stopped();
    status_tx.send_replace(SubscriptionStatus::Completed);
    info!("Subscription completed");
    Ok(())
}

async fn close_broker<B: BrokerClient>(state: &mut ReceiverState<B>) {
    if let Err(e) = state.broker.close().await {
        warn!(error = %e, "Failed to close broker client");
    }
}

/// Control handle for a running subscription.
///
/// Dropping the handle without awaiting it also requests stop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    endpoint: String,
    shutdown_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<SubscriptionStatus>,
    task: JoinHandle<ReceiverResult<()>>,
}

impl SubscriptionHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the loop to stop after its in-flight cycle
    pub fn request_stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch status transitions
    pub fn status_watch(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to terminate.
    ///
    /// Returns the setup error when the subscription gave up on setup.
    pub async fn await_completion(self) -> ReceiverResult<()> {
        let result = self.task.await;
        drop(self.shutdown_tx);
        result.map_err(|e| ReceiverError::internal(format!("receive loop task failed: {e}")))?
    }

    /// Request stop and wait for the loop to terminate
    pub async fn stop(self) -> ReceiverResult<()> {
        self.request_stop();
        self.await_completion().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, ReceiveMode};
    use crate::receiver::dispatch::JsonDeserializer;
    use crate::testing::mocks::{AckCall, FailingHandler, RecordingHandler, ScriptedBroker};
    use serde_json::Value;

    fn fast_settings() -> ReceiverSettings {
        ReceiverSettings {
            wait_timeout: Duration::from_millis(10),
            retry: RetryPolicy::new(2, 1, 5),
            setup: RetryPolicy::new(3, 1, 5),
        }
    }

    fn descriptor() -> EndpointDescriptor {
        EndpointDescriptor::new("orders", "Order", "OrderHandler")
            .with_max_retries(3)
            .with_error_pause(Duration::from_millis(5))
    }

    fn registry_with<H>(handler: H) -> Arc<HandlerRegistry>
    where
        H: crate::receiver::dispatch::MessageHandler<Value> + Clone + 'static,
    {
        let mut registry = HandlerRegistry::new();
        registry.register::<Value, _, _>("Order", "OrderHandler", move || handler.clone());
        Arc::new(registry)
    }

    async fn run_until_idle(broker: ScriptedBroker, registry: Arc<HandlerRegistry>) {
        let handle = SubscriptionReceiver::start(
            descriptor(),
            broker,
            registry,
            Arc::new(JsonDeserializer),
            fast_settings(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_success_completes_once() {
        let handler = RecordingHandler::<Value>::new();
        let broker = ScriptedBroker::new("orders")
            .then_message(InboundEnvelope::new("m-1", &b"{\"id\":1}"[..]));
        let journal = broker.journal();

        run_until_idle(broker, registry_with(handler.clone())).await;

        assert_eq!(journal.calls(), vec![AckCall::Complete("m-1".to_string())]);
        assert_eq!(handler.received().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_below_max_retries_abandons() {
        let broker = ScriptedBroker::new("orders")
            .then_message(InboundEnvelope::new("m-1", &b"{}"[..]).with_delivery_count(2));
        let journal = broker.journal();

        run_until_idle(broker, registry_with(FailingHandler::new("boom"))).await;

        assert_eq!(journal.calls(), vec![AckCall::Abandon("m-1".to_string())]);
    }

    #[tokio::test]
    async fn test_receive_and_delete_skips_acknowledgment() {
        let handler = RecordingHandler::<Value>::new();
        let broker = ScriptedBroker::new("orders")
            .with_mode(ReceiveMode::ReceiveAndDelete)
            .then_message(InboundEnvelope::new("m-1", &b"{}"[..]));
        let journal = broker.journal();

        run_until_idle(broker, registry_with(handler.clone())).await;

        assert!(journal.calls().is_empty());
        assert_eq!(handler.received().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_on_acknowledge_keeps_loop_alive() {
        let handler = RecordingHandler::<Value>::new();
        let mut broker = ScriptedBroker::new("orders")
            .then_message(InboundEnvelope::new("m-1", &b"{}"[..]))
            .then_message(InboundEnvelope::new("m-2", &b"{}"[..]));
        broker.fail_next_acknowledgment(BrokerError::Protocol("bad token".into()));
        let journal = broker.journal();

        run_until_idle(broker, registry_with(handler.clone())).await;

        assert_eq!(handler.received().len(), 2);
        assert_eq!(
            journal.calls(),
            vec![
                AckCall::Complete("m-1".to_string()),
                AckCall::Complete("m-2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_failure_reports_terminal_status() {
        let broker = ScriptedBroker::new("orders");
        let handle = SubscriptionReceiver::start(
            descriptor(),
            broker,
            Arc::new(HandlerRegistry::new()),
            Arc::new(JsonDeserializer),
            fast_settings(),
        );
        let mut status = handle.status_watch();

        let result = handle.await_completion().await;
        assert!(matches!(result, Err(ReceiverError::Setup { .. })));
        assert!(matches!(
            *status.borrow_and_update(),
            SubscriptionStatus::SetupFailed { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_broker_closed_after_stop() {
        let broker = ScriptedBroker::new("orders");
        let journal = broker.journal();

        run_until_idle(broker, registry_with(RecordingHandler::<Value>::new())).await;

        assert!(journal.is_closed());
    }

    #[test]
    fn test_status_terminal_states() {
        assert!(SubscriptionStatus::Completed.is_terminal());
        assert!(SubscriptionStatus::SetupFailed {
            attempts: 1,
            reason: "x".into()
        }
        .is_terminal());
        assert!(!SubscriptionStatus::Running.is_terminal());
        assert!(!SubscriptionStatus::Starting { attempt: 1 }.is_terminal());
    }

    #[test]
    fn test_status_serializes_with_state_tag() {
        let json = serde_json::to_value(SubscriptionStatus::SetupFailed {
            attempts: 3,
            reason: "no handler".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "setup_failed");
        assert_eq!(json["attempts"], 3);
    }
}
