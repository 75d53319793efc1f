//! Tests for logging configuration and the observability surface
//!
//! Covers format and level parsing, the span macros, and the per-endpoint
//! metrics a running subscription leaves behind.

use bus_receiver::broker::{InMemoryQueue, ReceiveMode};
use bus_receiver::observability::logging::{parse_level, LogFormat};
use bus_receiver::observability::metrics;
use bus_receiver::receiver::EndpointDescriptor;
use bus_receiver::testing::FailingHandler;
use bus_receiver::{broker_span, message_span, subscription_span};
use std::time::Duration;
use tracing::Level;

use test_helpers::*;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    for input in ["json", "JSON", "Json"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
    for input in ["pretty", "PRETTY"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Pretty);
    }
    for input in ["compact", "Compact"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact);
    }
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["invalid", "", "xml", "123", "  pretty  "] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input {input:?}");
    }
}

#[test]
fn test_log_level_parse_defaults_to_info() {
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_span_macros_accept_structured_fields() {
    let endpoint = "orders";
    let subscription = subscription_span!(endpoint = %endpoint, message_type = "OrderPlaced");
    let message = message_span!(message_id = "m-1", delivery_count = 2u32);
    let broker = broker_span!(operation = "complete");

    // No subscriber is installed, so the spans are disabled but must still build
    let _guard = subscription.enter();
    let _message = message.enter();
    drop(broker);
}

#[tokio::test]
async fn test_metrics_track_failures_per_endpoint() {
    let queue = InMemoryQueue::new("metrics/failing");
    queue.send(order_json(1));

    let descriptor = EndpointDescriptor::new("metrics/failing", MESSAGE_TYPE, HANDLER_TYPE)
        .with_max_retries(2)
        .with_error_pause(Duration::from_millis(5));
    let handle = start(
        descriptor,
        queue.client(ReceiveMode::PeekLock),
        registry_with(FailingHandler::new("nope")),
    );
    assert!(eventually(Duration::from_secs(5), || queue.dead_letters().len() == 1).await);
    handle.stop().await.unwrap();

    let snapshot = metrics().get_metrics();
    let stats = snapshot
        .endpoints
        .get("metrics/failing")
        .expect("endpoint stats should be recorded");
    assert_eq!(stats.received, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.succeeded, 0);
    assert!(!stats.stopped_by_setup_failure);
}

#[tokio::test]
async fn test_metrics_flag_endpoints_that_gave_up_setup() {
    let descriptor = EndpointDescriptor::new("metrics/unbound", MESSAGE_TYPE, "MissingHandler");
    let handle = start(
        descriptor,
        InMemoryQueue::new("metrics/unbound").client(ReceiveMode::PeekLock),
        registry_with(FailingHandler::new("unused")),
    );
    assert!(handle.await_completion().await.is_err());

    let snapshot = metrics().get_metrics();
    assert!(snapshot.endpoints["metrics/unbound"].stopped_by_setup_failure);
    assert!(snapshot.lifecycle.setup_give_ups >= 1);
}
