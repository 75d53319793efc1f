//! Retry policy and the guarded receive executor
//!
//! One call to [`ReceiveExecutor::receive`] performs one logical receive:
//! transient broker faults are retried internally with exponential backoff up
//! to the policy's attempt limit, anything else is handed back to the caller.

use crate::broker::{BrokerClient, BrokerError, InboundEnvelope};
use crate::observability::metrics;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay_ms`, then make attempt number `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// Policy for restarting subscription setup: many attempts, long ceiling
    pub fn setup_default() -> Self {
        Self::new(100, 100, 30_000)
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Decide whether another attempt follows `attempts_made` failed ones
    pub fn next_attempt(&self, attempts_made: u32, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }

        if attempts_made >= self.max_attempts {
            return RetryDecision::AbortMaxAttemptsExceeded;
        }

        RetryDecision::Proceed {
            attempt: attempts_made + 1,
            delay_ms: self.calculate_backoff_delay(attempts_made),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "initial_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Resolution of one guarded receive
#[derive(Debug)]
pub enum ReceiveAttempt {
    Received(InboundEnvelope),
    /// Wait timeout elapsed with no delivery
    Empty,
    /// Non-transient fault, or transient faults beyond the attempt limit
    Failed(BrokerError),
    /// Stop was requested before or during the receive
    Cancelled,
}

/// Runs one receive under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct ReceiveExecutor {
    policy: RetryPolicy,
}

impl ReceiveExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn receive<B: BrokerClient + ?Sized>(
        &self,
        broker: &mut B,
        wait_timeout: Duration,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> ReceiveAttempt {
        let mut shutdown = shutdown_rx.clone();
        let mut attempts = 0u32;

        loop {
            if *shutdown.borrow_and_update() {
                return ReceiveAttempt::Cancelled;
            }
            attempts += 1;

            let result = tokio::select! {
                result = broker
                    .receive(wait_timeout)
                    .instrument(crate::broker_span!(operation = "receive", attempt = attempts)) => result,
                _ = shutdown.changed() => {
                    debug!("Stop requested while waiting for a message");
                    return ReceiveAttempt::Cancelled;
                }
            };

            let error = match result {
                Ok(Some(envelope)) => return ReceiveAttempt::Received(envelope),
                Ok(None) => return ReceiveAttempt::Empty,
                Err(error) => error,
            };

            if !error.is_transient() {
                return ReceiveAttempt::Failed(error);
            }

            match self
                .policy
                .next_attempt(attempts, is_stop_requested(&shutdown))
            {
                RetryDecision::Proceed { attempt, delay_ms } => {
                    warn!(
                        error = %error,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms,
                        "Transient broker fault on receive, retrying"
                    );
                    metrics().transient_retry();
                    if !interruptible_sleep(&shutdown, Duration::from_millis(delay_ms)).await {
                        return ReceiveAttempt::Cancelled;
                    }
                }
                RetryDecision::AbortShutdownRequested => return ReceiveAttempt::Cancelled,
                RetryDecision::AbortMaxAttemptsExceeded => return ReceiveAttempt::Failed(error),
            }
        }
    }
}

/// True once stop was requested or the controlling handle is gone
pub(crate) fn is_stop_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}

/// Perform interruptible sleep with shutdown monitoring.
/// Returns true if the sleep completed, false if stop was requested.
pub(crate) async fn interruptible_sleep(shutdown_rx: &watch::Receiver<bool>, delay: Duration) -> bool {
    let mut shutdown = shutdown_rx.clone();
    if *shutdown.borrow_and_update() {
        return false;
    }

    tokio::select! {
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                info!("Stop requested during pause, not waiting further");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::ScriptedBroker;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_millis(10);

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 1, 5)
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = RetryPolicy::new(10, 100, 1000);
        assert_eq!(policy.calculate_backoff_delay(1), 100);
        assert_eq!(policy.calculate_backoff_delay(2), 200);
        assert_eq!(policy.calculate_backoff_delay(3), 400);
        assert_eq!(policy.calculate_backoff_delay(4), 800);
        assert_eq!(policy.calculate_backoff_delay(5), 1000);
        assert_eq!(policy.calculate_backoff_delay(200), 1000);
    }

    #[test]
    fn test_backoff_never_overflows() {
        let policy = RetryPolicy::new(10, u64::MAX / 2, u64::MAX);
        assert_eq!(policy.calculate_backoff_delay(64), u64::MAX);
    }

    #[test]
    fn test_next_attempt_decisions() {
        let policy = RetryPolicy::new(3, 100, 5000);

        assert_eq!(
            policy.next_attempt(1, false),
            RetryDecision::Proceed {
                attempt: 2,
                delay_ms: 100
            }
        );
        assert_eq!(
            policy.next_attempt(2, false),
            RetryDecision::Proceed {
                attempt: 3,
                delay_ms: 200
            }
        );
        assert_eq!(
            policy.next_attempt(3, false),
            RetryDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            policy.next_attempt(1, true),
            RetryDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::setup_default().validate().is_ok());
        assert!(RetryPolicy::new(0, 1, 1).validate().is_err());
        assert!(RetryPolicy::new(1, 10, 1).validate().is_err());
    }

    #[tokio::test]
    async fn test_transient_fault_is_retried_internally() {
        let mut broker = ScriptedBroker::new("orders")
            .then_error(BrokerError::Timeout("slow".into()))
            .then_error(BrokerError::ServerBusy("busy".into()))
            .then_message(InboundEnvelope::new("m-1", &b"{}"[..]));
        let (_tx, rx) = watch::channel(false);

        let attempt = ReceiveExecutor::new(fast_policy(3))
            .receive(&mut broker, WAIT, &rx)
            .await;

        match attempt {
            ReceiveAttempt::Received(envelope) => assert_eq!(envelope.message_id, "m-1"),
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(broker.receive_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_faults_beyond_limit_fail() {
        let mut broker = ScriptedBroker::new("orders")
            .then_error(BrokerError::Timeout("1".into()))
            .then_error(BrokerError::Timeout("2".into()))
            .then_message(InboundEnvelope::new("m-1", &b"{}"[..]));
        let (_tx, rx) = watch::channel(false);

        let attempt = ReceiveExecutor::new(fast_policy(2))
            .receive(&mut broker, WAIT, &rx)
            .await;

        assert!(matches!(attempt, ReceiveAttempt::Failed(BrokerError::Timeout(_))));
        assert_eq!(broker.receive_count(), 2);
    }

    #[tokio::test]
    async fn test_non_transient_fault_is_not_retried() {
        let mut broker =
            ScriptedBroker::new("orders").then_error(BrokerError::Unavailable("gone".into()));
        let (_tx, rx) = watch::channel(false);

        let attempt = ReceiveExecutor::new(fast_policy(5))
            .receive(&mut broker, WAIT, &rx)
            .await;

        assert!(matches!(attempt, ReceiveAttempt::Failed(BrokerError::Unavailable(_))));
        assert_eq!(broker.receive_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_receive() {
        let mut broker = ScriptedBroker::new("orders").then_empty();
        let (_tx, rx) = watch::channel(false);

        let attempt = ReceiveExecutor::default()
            .receive(&mut broker, WAIT, &rx)
            .await;
        assert!(matches!(attempt, ReceiveAttempt::Empty));
    }

    #[tokio::test]
    async fn test_stop_before_receive_is_cancelled() {
        let mut broker = ScriptedBroker::new("orders");
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let attempt = ReceiveExecutor::default()
            .receive(&mut broker, WAIT, &rx)
            .await;
        assert!(matches!(attempt, ReceiveAttempt::Cancelled));
        assert_eq!(broker.receive_count(), 0);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(&rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        assert!(!interruptible_sleep(&rx, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_stop() {
        let (tx, rx) = watch::channel(false);
        drop(tx);

        assert!(is_stop_requested(&rx));
        assert!(!interruptible_sleep(&rx, Duration::from_secs(5)).await);
    }
}
