//! Metrics definitions for the Meeting Controller
//!
//! All metrics follow Prometheus naming conventions:
//! - `mc_` prefix for Meeting Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values max (controller, meeting, connection)
//! - `operation`: bounded by store operations and client message types (~20 values)
//! - `message_type`: bounded by client message types (~15 values)
//! - `outcome`: admitted, waiting, denied, error
//! - `kind`: offer, answer, candidate
//!
//! Meeting ids, person ids and connection ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
/// Configures histogram buckets aligned with latency targets:
/// - Message latency p99 < 100ms
/// - Store latency p99 < 25ms
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Message latency buckets - in-process room handling
        .set_buckets_for_metric(
            Matcher::Prefix("mc_message".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Store latency buckets - durable reads and writes (like DB queries)
        .set_buckets_for_metric(
            Matcher::Prefix("mc_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        // Signaling session duration buckets - long lived sockets
        .set_buckets_for_metric(
            Matcher::Prefix("mc_signaling_session".to_string()),
            &[1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0],
        )
        .map_err(|e| format!("Failed to set session duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Meeting Metrics (Gauges)
// ============================================================================

/// Set the number of joined signaling connections.
///
/// Metric: `mc_connections_active`
/// Labels: none
///
/// This is updated by the actor system when connection actors start/stop.
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_connections_active").set(count as f64);
}

/// Set the number of live rooms.
///
/// Metric: `mc_meetings_active`
/// Labels: none
pub fn set_meetings_active(count: u64) {
    // u64 to f64 conversion is safe for realistic meeting counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_meetings_active").set(count as f64);
}

// ============================================================================
// Actor Mailbox Metrics (Gauges)
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `mc_actor_mailbox_depth`
/// Labels: `actor_type` (controller, meeting, connection)
///
/// Used for backpressure monitoring. High values indicate the actor is
/// falling behind in message processing.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    // usize to f64 conversion is safe for realistic mailbox depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record room processing latency for one client message.
///
/// Metric: `mc_message_latency_seconds`
/// Labels: `message_type`
///
/// Target: p99 < 100ms
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("mc_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record durable store operation latency (one attempt).
///
/// Metric: `mc_store_latency_seconds`
/// Labels: `operation`
///
/// Operations: find_meeting, save_meeting, find_chat_history, append_chat_message
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!("mc_store_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record how long a signaling socket stayed open.
///
/// Metric: `mc_signaling_session_duration_seconds`
/// Labels: none
pub fn record_signaling_session_duration(duration: Duration) {
    histogram!("mc_signaling_session_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Room Activity Metrics (Counters)
// ============================================================================

/// Record an admission decision.
///
/// Metric: `mc_admission_decisions_total`
/// Labels: `outcome` (admitted, waiting, denied, error)
pub fn record_admission_decision(outcome: &str) {
    counter!("mc_admission_decisions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a relayed or dropped offer/answer/candidate.
///
/// Metric: `mc_signaling_relayed_total`
/// Labels: `kind` (offer, answer, candidate), `result` (relayed, dropped)
///
/// Cardinality: 6
pub fn record_signaling_relayed(kind: &str, result: &str) {
    counter!("mc_signaling_relayed_total",
        "kind" => kind.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record a chat message that was delivered live but not persisted.
///
/// Metric: `mc_chat_persist_failures_total`
/// Labels: none
pub fn record_chat_persist_failure() {
    counter!("mc_chat_persist_failures_total").increment(1);
}

/// Record a signaling socket lifecycle event.
///
/// Metric: `mc_signaling_connections_total`
/// Labels: `event` (opened, joined, rejected, idle_timeout, closed)
pub fn record_signaling_connection(event: &str) {
    counter!("mc_signaling_connections_total", "event" => event.to_string()).increment(1);
}

// ============================================================================
// Additional Operational Metrics
// ============================================================================

/// Record an actor panic event.
///
/// Metric: `mc_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("mc_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record messages dropped due to backpressure.
///
/// Metric: `mc_messages_dropped_total`
/// Labels: `actor_type`
///
/// Non-zero values indicate slow consumers were evicted.
pub fn record_message_dropped(actor_type: &str) {
    counter!("mc_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record error by category.
///
/// Metric: `mc_errors_total`
/// Labels: `operation`, `error_type`, `status_code`
///
/// `status_code` is the signaling error code carried in the `error` event.
pub fn record_error(operation: &str, error_type: &str, status_code: u16) {
    counter!("mc_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string(),
        "status_code" => status_code.to_string()
    )
    .increment(1);
}
