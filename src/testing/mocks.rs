//! Mock implementations for testing
//!
//! Provides a scripted broker client with an acknowledgment journal and fault
//! injection, plus handlers that record, fail or block, so the receive loop can
//! be exercised without a real broker.

use crate::broker::{BrokerClient, BrokerError, InboundEnvelope, ReceiveMode};
use crate::receiver::dispatch::{HandlerError, MessageHandler, ReceivedMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// One settle call observed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckCall {
    Complete(String),
    Abandon(String),
    DeadLetter {
        message_id: String,
        reason: String,
        description: String,
    },
}

impl AckCall {
    pub fn message_id(&self) -> &str {
        match self {
            AckCall::Complete(id) | AckCall::Abandon(id) => id,
            AckCall::DeadLetter { message_id, .. } => message_id,
        }
    }
}

#[derive(Debug, Default)]
struct JournalState {
    calls: Vec<AckCall>,
    receive_times: Vec<Instant>,
    opens: u32,
    closed: bool,
}

/// Shared record of everything a [`ScriptedBroker`] was asked to do.
///
/// Stays readable after the broker itself moved into a receive loop.
#[derive(Debug, Clone, Default)]
pub struct AckJournal {
    state: Arc<Mutex<JournalState>>,
}

impl AckJournal {
    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every settle call in order, including ones that failed
    pub fn calls(&self) -> Vec<AckCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, message_id: &str) -> Vec<AckCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.message_id() == message_id)
            .cloned()
            .collect()
    }

    pub fn receive_count(&self) -> usize {
        self.lock().receive_times.len()
    }

    /// When each receive call was issued
    pub fn receive_times(&self) -> Vec<Instant> {
        self.lock().receive_times.clone()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[derive(Debug)]
enum ScriptStep {
    Message(InboundEnvelope),
    Empty,
    Error(BrokerError),
}

/// Broker client that replays a fixed script of receive results.
///
/// Once the script runs out, every receive waits out its timeout and reports
/// no message, like an idle queue.
#[derive(Debug)]
pub struct ScriptedBroker {
    entity_path: String,
    mode: ReceiveMode,
    script: VecDeque<ScriptStep>,
    ack_failures: VecDeque<BrokerError>,
    open_failures: VecDeque<BrokerError>,
    journal: AckJournal,
}

impl ScriptedBroker {
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            mode: ReceiveMode::PeekLock,
            script: VecDeque::new(),
            ack_failures: VecDeque::new(),
            open_failures: VecDeque::new(),
            journal: AckJournal::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReceiveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn then_message(mut self, envelope: InboundEnvelope) -> Self {
        self.script.push_back(ScriptStep::Message(envelope));
        self
    }

    /// A receive that timed out with no delivery
    pub fn then_empty(mut self) -> Self {
        self.script.push_back(ScriptStep::Empty);
        self
    }

    pub fn then_error(mut self, error: BrokerError) -> Self {
        self.script.push_back(ScriptStep::Error(error));
        self
    }

    /// Fail the next settle call (after recording it) with `error`
    pub fn fail_next_acknowledgment(&mut self, error: BrokerError) {
        self.ack_failures.push_back(error);
    }

    /// Fail the next `times` calls to `open`
    pub fn fail_open(mut self, times: usize, error: BrokerError) -> Self {
        for _ in 0..times {
            self.open_failures.push_back(error.clone());
        }
        self
    }

    pub fn journal(&self) -> AckJournal {
        self.journal.clone()
    }

    pub fn receive_count(&self) -> usize {
        self.journal.receive_count()
    }

    fn settle(&mut self, call: AckCall) -> Result<(), BrokerError> {
        self.journal.lock().calls.push(call);
        match self.ack_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    fn entity_path(&self) -> &str {
        &self.entity_path
    }

    fn mode(&self) -> ReceiveMode {
        self.mode
    }

    async fn open(&mut self) -> Result<(), BrokerError> {
        self.journal.lock().opens += 1;
        match self.open_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn receive(
        &mut self,
        wait_timeout: Duration,
    ) -> Result<Option<InboundEnvelope>, BrokerError> {
        self.journal.lock().receive_times.push(Instant::now());

        match self.script.pop_front() {
            Some(ScriptStep::Message(envelope)) => Ok(Some(envelope)),
            Some(ScriptStep::Empty) => Ok(None),
            Some(ScriptStep::Error(error)) => Err(error),
            None => {
                tokio::time::sleep(wait_timeout).await;
                Ok(None)
            }
        }
    }

    async fn complete(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError> {
        self.settle(AckCall::Complete(envelope.message_id.clone()))
    }

    async fn abandon(&mut self, envelope: &InboundEnvelope) -> Result<(), BrokerError> {
        self.settle(AckCall::Abandon(envelope.message_id.clone()))
    }

    async fn dead_letter(
        &mut self,
        envelope: &InboundEnvelope,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        self.settle(AckCall::DeadLetter {
            message_id: envelope.message_id.clone(),
            reason: reason.to_string(),
            description: description.to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.journal.lock().closed = true;
        Ok(())
    }
}

/// Handler that records every message it receives
#[derive(Debug)]
pub struct RecordingHandler<M> {
    received: Arc<Mutex<Vec<ReceivedMessage<M>>>>,
}

impl<M> Clone for RecordingHandler<M> {
    fn clone(&self) -> Self {
        Self {
            received: self.received.clone(),
        }
    }
}

impl<M> Default for RecordingHandler<M> {
    fn default() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<M: Clone> RecordingHandler<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<ReceivedMessage<M>> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<M> MessageHandler<M> for RecordingHandler<M>
where
    M: Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage<M>) -> Result<(), HandlerError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(message);
        }
        Ok(())
    }
}

/// Handler that always fails with the same message
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
    calls: Arc<Mutex<u32>>,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.lock().map(|calls| *calls).unwrap_or_default()
    }
}

#[async_trait]
impl<M> MessageHandler<M> for FailingHandler
where
    M: Send + 'static,
{
    async fn handle(&self, _message: ReceivedMessage<M>) -> Result<(), HandlerError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        Err(self.message.clone().into())
    }
}

/// Handler that parks inside `handle` until released
#[derive(Debug, Clone, Default)]
pub struct BlockingHandler {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    completed: Arc<Mutex<Vec<String>>>,
}

impl BlockingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a call has entered `handle`
    pub async fn wait_until_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one parked call return
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Message ids whose handling ran to completion
    pub fn completed(&self) -> Vec<String> {
        self.completed
            .lock()
            .map(|completed| completed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<M> MessageHandler<M> for BlockingHandler
where
    M: Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage<M>) -> Result<(), HandlerError> {
        self.entered.notify_one();
        self.release.notified().await;
        if let Ok(mut completed) = self.completed.lock() {
            completed.push(message.message_id);
        }
        Ok(())
    }
}
