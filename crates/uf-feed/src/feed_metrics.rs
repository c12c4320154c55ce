//! Metrics for the feed pipeline
//!
//! Counters and gauges are recorded through the `metrics` facade; installing
//! an exporter is up to the application.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use uf_common::{MessageKind, ProducerId};

/// Record a parsed message
pub fn record_message_received(producer_id: ProducerId, kind: MessageKind) {
    counter!(
        "uf_messages_received_total",
        "producer" => producer_id.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record generation-to-receipt latency
pub fn record_message_latency(kind: MessageKind, latency: Duration) {
    histogram!(
        "uf_message_latency_seconds",
        "kind" => kind.as_str()
    )
    .record(latency.as_secs_f64());
}

pub fn record_empty_delivery() {
    counter!("uf_empty_deliveries_total").increment(1);
}

pub fn record_deserialization_failure() {
    counter!("uf_deserialization_failures_total").increment(1);
}

pub fn record_unknown_producer(producer_id: ProducerId) {
    counter!(
        "uf_unknown_producer_messages_total",
        "producer" => producer_id.to_string()
    )
    .increment(1);
}

/// Record a message withheld from dispatch
pub fn record_message_suppressed(producer_id: ProducerId, reason: &'static str) {
    counter!(
        "uf_messages_suppressed_total",
        "producer" => producer_id.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a recovery request accepted by the API
pub fn record_recovery_issued(producer_id: ProducerId, full_snapshot: bool) {
    counter!(
        "uf_recovery_requests_total",
        "producer" => producer_id.to_string(),
        "type" => if full_snapshot { "full" } else { "after" }
    )
    .increment(1);
}

pub fn record_recovery_failed(producer_id: ProducerId) {
    counter!(
        "uf_recovery_request_failures_total",
        "producer" => producer_id.to_string()
    )
    .increment(1);
}

pub fn record_recovery_completed(producer_id: ProducerId, duration: Duration) {
    counter!(
        "uf_recoveries_completed_total",
        "producer" => producer_id.to_string()
    )
    .increment(1);
    histogram!(
        "uf_recovery_duration_seconds",
        "producer" => producer_id.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_recovery_timed_out(producer_id: ProducerId) {
    counter!(
        "uf_recovery_timeouts_total",
        "producer" => producer_id.to_string()
    )
    .increment(1);
}

/// 1 while the producer is up, 0 otherwise
pub fn set_producer_up(producer_id: ProducerId, up: bool) {
    gauge!(
        "uf_producer_up",
        "producer" => producer_id.to_string()
    )
    .set(if up { 1.0 } else { 0.0 });
}

pub fn record_session_dispatch(session: &str) {
    counter!(
        "uf_session_messages_total",
        "session" => session.to_string()
    )
    .increment(1);
}

pub fn set_session_count(count: usize) {
    gauge!("uf_sessions").set(count as f64);
}
