//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! receive, dispatch, acknowledgment and subscription lifecycle statistics.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Receive metrics
    messages_received: AtomicU64,
    empty_receives: AtomicU64,
    transient_retries: AtomicU64,
    receive_failures: AtomicU64,

    // Dispatch metrics
    dispatch_succeeded: AtomicU64,
    handler_failures: AtomicU64,
    deserialization_failures: AtomicU64,
    processing_times: Mutex<Vec<u64>>, // in milliseconds

    // Acknowledgment metrics
    completed: AtomicU64,
    abandoned: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    acknowledgments_swallowed: AtomicU64,

    // Lifecycle metrics
    setup_attempts: AtomicU64,
    setup_give_ups: AtomicU64,
    active_subscriptions: AtomicU64,
    uptime_start: AtomicU64,

    endpoint_stats: Mutex<HashMap<String, EndpointStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            empty_receives: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            receive_failures: AtomicU64::new(0),
            dispatch_succeeded: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            deserialization_failures: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            acknowledgments_swallowed: AtomicU64::new(0),
            setup_attempts: AtomicU64::new(0),
            setup_give_ups: AtomicU64::new(0),
            active_subscriptions: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
            endpoint_stats: Mutex::new(HashMap::new()),
        }
    }

    /// Apply `update` to the stats entry for `endpoint`
    fn with_endpoint<F: FnOnce(&mut EndpointStats)>(&self, endpoint: &str, update: F) {
        if let Ok(mut stats) = self.endpoint_stats.lock() {
            let entry = stats
                .entry(endpoint.to_string())
                .or_insert_with(|| EndpointStats::new(endpoint));
            update(entry);
        }
    }

    // Receive metrics
    pub fn message_received(&self, endpoint: &str) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| {
            stats.received += 1;
            stats.last_received = current_timestamp();
        });
    }

    pub fn empty_receive(&self) {
        self.empty_receives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receive_failed(&self, endpoint: &str) {
        self.receive_failures.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| stats.receive_failures += 1);
    }

    // Dispatch metrics
    pub fn dispatch_succeeded(&self, endpoint: &str, duration: Duration) {
        self.dispatch_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration);
        self.with_endpoint(endpoint, |stats| stats.succeeded += 1);
    }

    pub fn handler_failed(&self, endpoint: &str, duration: Duration) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        // Record processing time even for failed messages
        self.record_processing_time(duration);
        self.with_endpoint(endpoint, |stats| stats.failed += 1);
    }

    pub fn deserialization_failed(&self, endpoint: &str) {
        self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| stats.failed += 1);
    }

    fn record_processing_time(&self, duration: Duration) {
        if let Ok(mut times) = self.processing_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_TIMING_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Acknowledgment metrics
    pub fn message_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dead_lettered(&self, endpoint: &str) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| stats.dead_lettered += 1);
    }

    pub fn message_dropped(&self, endpoint: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| stats.dropped += 1);
    }

    pub fn acknowledgment_swallowed(&self) {
        self.acknowledgments_swallowed
            .fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn setup_attempted(&self) {
        self.setup_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn setup_gave_up(&self, endpoint: &str) {
        self.setup_give_ups.fetch_add(1, Ordering::Relaxed);
        self.with_endpoint(endpoint, |stats| stats.stopped_by_setup_failure = true);
    }

    pub fn subscription_started(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_stopped(&self) {
        // Saturate at zero so a reset between start and stop cannot wrap
        let _ = self.active_subscriptions.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |current| Some(current.saturating_sub(1)),
        );
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.empty_receives,
            &self.transient_retries,
            &self.receive_failures,
            &self.dispatch_succeeded,
            &self.handler_failures,
            &self.deserialization_failures,
            &self.completed,
            &self.abandoned,
            &self.dead_lettered,
            &self.dropped,
            &self.acknowledgments_swallowed,
            &self.setup_attempts,
            &self.setup_give_ups,
            &self.active_subscriptions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.endpoint_stats.lock() {
            stats.clear();
        }
    }

    /// Calculate processing time statistics (pure function)
    fn calculate_processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(times) = self.processing_times.lock() {
            if times.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();

                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                let p50 = percentile(&sorted_times, 50.0);
                let p95 = percentile(&sorted_times, 95.0);
                let p99 = percentile(&sorted_times, 99.0);

                (avg, p50, p95, p99)
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    fn endpoint_snapshots(&self) -> HashMap<String, EndpointStats> {
        self.endpoint_stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95, p99) = self.calculate_processing_time_statistics();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            receive: ReceiveMetrics {
                messages_received: load(&self.messages_received),
                empty_receives: load(&self.empty_receives),
                transient_retries: load(&self.transient_retries),
                receive_failures: load(&self.receive_failures),
            },
            dispatch: DispatchMetrics {
                succeeded: load(&self.dispatch_succeeded),
                handler_failures: load(&self.handler_failures),
                deserialization_failures: load(&self.deserialization_failures),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
            },
            acknowledgment: AcknowledgmentMetrics {
                completed: load(&self.completed),
                abandoned: load(&self.abandoned),
                dead_lettered: load(&self.dead_lettered),
                dropped: load(&self.dropped),
                swallowed_failures: load(&self.acknowledgments_swallowed),
            },
            lifecycle: LifecycleMetrics {
                setup_attempts: load(&self.setup_attempts),
                setup_give_ups: load(&self.setup_give_ups),
                active_subscriptions: load(&self.active_subscriptions),
                uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            },
            endpoints: self.endpoint_snapshots(),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-endpoint counters
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub receive_failures: u64,
    pub last_received: u64,
    pub stopped_by_setup_failure: bool,
}

impl EndpointStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            received: 0,
            succeeded: 0,
            failed: 0,
            dead_lettered: 0,
            dropped: 0,
            receive_failures: 0,
            last_received: 0,
            stopped_by_setup_failure: false,
        }
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub receive: ReceiveMetrics,
    pub dispatch: DispatchMetrics,
    pub acknowledgment: AcknowledgmentMetrics,
    pub lifecycle: LifecycleMetrics,
    pub endpoints: HashMap<String, EndpointStats>,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ReceiveMetrics {
    pub messages_received: u64,
    pub empty_receives: u64,
    pub transient_retries: u64,
    pub receive_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct DispatchMetrics {
    pub succeeded: u64,
    pub handler_failures: u64,
    pub deserialization_failures: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct AcknowledgmentMetrics {
    pub completed: u64,
    pub abandoned: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub swallowed_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub setup_attempts: u64,
    pub setup_give_ups: u64,
    pub active_subscriptions: u64,
    pub uptime_seconds: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
