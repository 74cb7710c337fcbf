//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Transport connection status and keepalive latency
//! - Queue depth, enqueues and drops
//! - Publish outcomes and latency
//! - Throttler decisions and trailing fires
//! - Event dispatch
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! The crate only emits through the `metrics` facade; installing an exporter
//! is up to the host.
//!
//! # Usage
//!
//! ```rust,no_run
//! use event_relay::metrics;
//! use std::time::Duration;
//!
//! // In the publisher worker after a successful send
//! metrics::record_publish("redis", true, Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a connection attempt.
pub fn record_connection_attempt(transport: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_connections_total", "transport" => transport.to_string(), "status" => status).increment(1);
}

/// Record a connection state transition.
pub fn record_connection_state(transport: &str, state: &str) {
    counter!("relay_connection_transitions_total", "transport" => transport.to_string(), "state" => state.to_string()).increment(1);
    gauge!("relay_connected", "transport" => transport.to_string())
        .set(if state == "connected" { 1.0 } else { 0.0 });
}

/// Record keepalive round-trip latency.
pub fn record_heartbeat_latency(transport: &str, latency: Duration) {
    histogram!("relay_heartbeat_latency_seconds", "transport" => transport.to_string())
        .record(latency.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a message accepted into a publisher queue.
pub fn record_enqueued(transport: &str) {
    counter!("relay_enqueued_total", "transport" => transport.to_string()).increment(1);
}

/// Record a message dropped before delivery.
///
/// Reasons: `queue_full`, `serialization`, `publish_failed`, `released`,
/// `shutdown`.
pub fn record_dropped(transport: &str, reason: &'static str) {
    counter!("relay_dropped_total", "transport" => transport.to_string(), "reason" => reason).increment(1);
}

/// Record a failed message pushed back onto the queue.
pub fn record_requeued(transport: &str) {
    counter!("relay_requeued_total", "transport" => transport.to_string()).increment(1);
}

/// Record current queue depth.
pub fn record_queue_depth(transport: &str, depth: usize) {
    gauge!("relay_queue_depth", "transport" => transport.to_string()).set(depth as f64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Publish
// ═══════════════════════════════════════════════════════════════════════════════

/// Record one network publish attempt.
pub fn record_publish(transport: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_publish_total", "transport" => transport.to_string(), "status" => status).increment(1);
    histogram!("relay_publish_duration_seconds", "transport" => transport.to_string())
        .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════════
// Throttle
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a throttler decision: `immediate`, `deferred` or `replaced`.
pub fn record_throttle_decision(decision: &'static str) {
    counter!("relay_throttle_decisions_total", "decision" => decision).increment(1);
}

/// Record a trailing event published by its timer.
pub fn record_trailing_fire() {
    counter!("relay_throttle_trailing_fires_total").increment(1);
}

/// Record a trailing event discarded without publish.
///
/// Reasons: `superseded`, `deleted`, `reset`.
pub fn record_trailing_discarded(reason: &'static str) {
    counter!("relay_throttle_trailing_discarded_total", "reason" => reason).increment(1);
}

/// Record number of tracked throttle keys.
pub fn record_throttle_keys(count: usize) {
    gauge!("relay_throttle_keys").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════════

/// Record an event handed to the broker.
pub fn record_event_dispatched(identity: &str) {
    counter!("relay_events_dispatched_total", "identity" => identity.to_string()).increment(1);
}

/// Record an event suppressed by configuration (`disabled`, `origin`).
pub fn record_event_skipped(identity: &str, reason: &'static str) {
    counter!("relay_events_skipped_total", "identity" => identity.to_string(), "reason" => reason).increment(1);
}

/// Record a failed host resource lookup.
pub fn record_lookup_failure(resource: &'static str) {
    counter!("relay_lookup_failures_total", "resource" => resource).increment(1);
}
