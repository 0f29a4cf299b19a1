//! Probe and status endpoints for the Meeting Controller
//!
//! - `GET /health` - liveness, 200 while the process runs
//! - `GET /ready` - 200 only while accepting joins, 503 while starting or draining
//! - `GET /status` - JSON with the service phase and live room/connection counts
//! - `GET /metrics` - Prometheus text exposition (see [`metrics_router`])

use crate::actors::ActorMetrics;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase reported by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePhase {
    /// Listeners not bound yet.
    Starting,
    /// Accepting joins.
    Serving,
    /// Shutdown signal received; rooms are being closed.
    Draining,
}

impl ServicePhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ServicePhase::Starting => "starting",
            ServicePhase::Serving => "serving",
            ServicePhase::Draining => "draining",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ServicePhase::Serving,
            2 => ServicePhase::Draining,
            _ => ServicePhase::Starting,
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            ServicePhase::Starting => 0,
            ServicePhase::Serving => 1,
            ServicePhase::Draining => 2,
        }
    }
}

/// Shared probe state.
#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
    actors: Arc<ActorMetrics>,
}

impl HealthState {
    /// New state in [`ServicePhase::Starting`], reading counts from `actors`.
    #[must_use]
    pub fn new(actors: Arc<ActorMetrics>) -> Self {
        Self {
            phase: AtomicU8::new(ServicePhase::Starting.to_u8()),
            actors,
        }
    }

    #[must_use]
    pub fn phase(&self) -> ServicePhase {
        ServicePhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Listeners are bound; start accepting joins.
    pub fn set_serving(&self) {
        self.phase
            .store(ServicePhase::Serving.to_u8(), Ordering::SeqCst);
    }

    /// Stop advertising readiness. There is no way back to serving.
    pub fn set_draining(&self) {
        self.phase
            .store(ServicePhase::Draining.to_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == ServicePhase::Serving
    }

    fn status(&self) -> ServiceStatus {
        ServiceStatus {
            phase: self.phase(),
            meetings: self.actors.meeting_count(),
            connections: self.actors.connection_count(),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub phase: ServicePhase,
    pub meetings: usize,
    pub connections: usize,
}

/// Router with `/health`, `/ready` and `/status`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .with_state(health_state)
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let phase = state.phase();
    if phase == ServicePhase::Serving {
        (StatusCode::OK, phase.as_str())
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, phase.as_str())
    }
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> Json<ServiceStatus> {
    Json(state.status())
}

/// Create the `/metrics` router backed by the installed Prometheus recorder.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
