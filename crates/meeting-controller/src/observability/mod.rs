//! Observability module for the Meeting Controller
//!
//! # Privacy by Default
//!
//! All instrumentation uses `#[instrument(skip_all)]` and explicit safe field allow-listing.
//! Display names, chat text and SDP bodies are never logged. Metric labels are bounded
//! to prevent cardinality explosion.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mc_connections_active` | Gauge | none | Joined signaling connections |
//! | `mc_meetings_active` | Gauge | none | Live rooms |
//! | `mc_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator per actor type |
//! | `mc_message_latency_seconds` | Histogram | `message_type` | Room processing latency |
//! | `mc_store_latency_seconds` | Histogram | `operation` | Durable store latency |
//! | `mc_signaling_session_duration_seconds` | Histogram | none | Socket lifetime |
//! | `mc_admission_decisions_total` | Counter | `outcome` | Admission outcomes |
//! | `mc_signaling_relayed_total` | Counter | `kind`, `result` | Offer/answer/candidate relay |
//! | `mc_chat_persist_failures_total` | Counter | none | Chat delivered but not stored |
//! | `mc_signaling_connections_total` | Counter | `event` | Socket lifecycle |
//! | `mc_actor_panics_total` | Counter | `actor_type` | Actor bugs |
//! | `mc_messages_dropped_total` | Counter | `actor_type` | Slow consumer evictions |
//! | `mc_errors_total` | Counter | `operation`, `error_type`, `status_code` | Errors by category |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthState, ServicePhase};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_admission_decision,
    record_chat_persist_failure, record_error, record_message_dropped, record_message_latency,
    record_signaling_connection, record_signaling_relayed, record_signaling_session_duration,
    record_store_latency, set_actor_mailbox_depth, set_connections_active, set_meetings_active,
};
