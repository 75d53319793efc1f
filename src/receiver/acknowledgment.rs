//! Acknowledgment decisions and the fault-absorbing gateway
//!
//! Every received envelope is settled exactly once: completed, abandoned or
//! dead-lettered. A settle call that fails because the lock is gone or the
//! entity is unreachable is absorbed, since the broker redelivers on lock
//! expiry anyway. Only protocol violations propagate.

use crate::broker::{BrokerClient, BrokerError, InboundEnvelope};
use crate::error::truncate_error_message;
use crate::observability::metrics;
use crate::receiver::dispatch::DispatchOutcome;
use crate::receiver::endpoint::EndpointAttributes;
use tracing::{debug, warn, Instrument};

/// Description attached to every dead-lettered message
pub const DEAD_LETTER_DESCRIPTION: &str = "Max retries exceeded.";

/// Longest dead-letter reason sent to the broker
pub const MAX_DEAD_LETTER_REASON_LEN: usize = 4096;

/// Terminal disposition for one received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcknowledgmentDecision {
    Complete,
    Abandon,
    DeadLetter { reason: String },
}

impl AcknowledgmentDecision {
    /// Decide how to settle a message from its dispatch outcome and delivery count.
    ///
    /// A failing message that exhausted its retries is dead-lettered, or
    /// completed (dropped) when the endpoint disables dead-lettering.
    pub fn decide(
        outcome: &DispatchOutcome,
        delivery_count: u32,
        attributes: &EndpointAttributes,
    ) -> Self {
        let failure = match outcome.failure_message() {
            None => return AcknowledgmentDecision::Complete,
            Some(message) => message,
        };

        if !attributes.retries_exhausted(delivery_count) {
            return AcknowledgmentDecision::Abandon;
        }

        if attributes.dead_letter_after_max_retries {
            AcknowledgmentDecision::DeadLetter {
                reason: dead_letter_reason(&failure),
            }
        } else {
            AcknowledgmentDecision::Complete
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AcknowledgmentDecision::Complete => "complete",
            AcknowledgmentDecision::Abandon => "abandon",
            AcknowledgmentDecision::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// The failure message as-is, bounded and never empty
fn dead_letter_reason(failure: &str) -> String {
    if failure.trim().is_empty() {
        DEAD_LETTER_DESCRIPTION.to_string()
    } else {
        truncate_error_message(failure, MAX_DEAD_LETTER_REASON_LEN)
    }
}

fn settle_span(operation: &'static str, envelope: &InboundEnvelope) -> tracing::Span {
    crate::broker_span!(operation, message_id = %envelope.message_id)
}

/// Safe wrappers around the broker's settle calls.
///
/// Each returns `Ok(true)` when the broker accepted the transition and
/// `Ok(false)` when a tolerated fault was absorbed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgmentGateway;

impl AcknowledgmentGateway {
    pub async fn complete<B: BrokerClient + ?Sized>(
        broker: &mut B,
        envelope: &InboundEnvelope,
    ) -> Result<bool, BrokerError> {
        let result = broker
            .complete(envelope)
            .instrument(settle_span("complete", envelope))
            .await;
        Self::absorb("complete", envelope, result)
    }

    pub async fn abandon<B: BrokerClient + ?Sized>(
        broker: &mut B,
        envelope: &InboundEnvelope,
    ) -> Result<bool, BrokerError> {
        let result = broker
            .abandon(envelope)
            .instrument(settle_span("abandon", envelope))
            .await;
        Self::absorb("abandon", envelope, result)
    }

    pub async fn dead_letter<B: BrokerClient + ?Sized>(
        broker: &mut B,
        envelope: &InboundEnvelope,
        reason: &str,
    ) -> Result<bool, BrokerError> {
        let result = broker
            .dead_letter(envelope, reason, DEAD_LETTER_DESCRIPTION)
            .instrument(settle_span("dead_letter", envelope))
            .await;
        Self::absorb("dead_letter", envelope, result)
    }

    /// Carry out `decision` with exactly one broker call
    pub async fn apply<B: BrokerClient + ?Sized>(
        broker: &mut B,
        envelope: &InboundEnvelope,
        decision: &AcknowledgmentDecision,
    ) -> Result<bool, BrokerError> {
        match decision {
            AcknowledgmentDecision::Complete => Self::complete(broker, envelope).await,
            AcknowledgmentDecision::Abandon => Self::abandon(broker, envelope).await,
            AcknowledgmentDecision::DeadLetter { reason } => {
                Self::dead_letter(broker, envelope, reason).await
            }
        }
    }

    fn absorb(
        operation: &'static str,
        envelope: &InboundEnvelope,
        result: Result<(), BrokerError>,
    ) -> Result<bool, BrokerError> {
        match result {
            Ok(()) => {
                debug!(
                    message_id = %envelope.message_id,
                    operation,
                    "Acknowledgment accepted"
                );
                Ok(true)
            }
            Err(e) if e.is_tolerated_on_acknowledge() => {
                warn!(
                    message_id = %envelope.message_id,
                    operation,
                    error = %e,
                    "Acknowledgment failed, broker will redeliver after lock expiry"
                );
                metrics().acknowledgment_swallowed();
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
