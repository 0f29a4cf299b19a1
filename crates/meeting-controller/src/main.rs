//! Meeting Controller
//!
//! WebSocket signaling server for real-time meeting coordination.
//!
//! # Servers
//!
//! The Meeting Controller runs two servers:
//! - HTTP server for the client signaling socket `GET /ws` (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Load the meeting store (optionally seeded from `MC_MEETINGS_FILE`)
//! 4. Initialize actor system (`MeetingControllerActorHandle`)
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start signaling server and mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meeting_controller::actors::{ActorMetrics, ControllerConfig, MeetingControllerActorHandle};
use meeting_controller::config::Config;
use meeting_controller::observability::health::metrics_router;
use meeting_controller::observability::{health_router, init_metrics_recorder, HealthState};
use meeting_controller::store::{InMemoryMeetingStore, MeetingStore};
use meeting_controller::transport::{signaling_router, SignalingState, TransportConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time rooms get to close their connections on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meeting_controller=debug,mc=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Meeting Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        mc_id = %config.mc_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        max_meetings = config.max_meetings,
        max_participants_per_meeting = config.max_participants_per_meeting,
        announce_fallback_ms = config.announce_fallback.as_millis(),
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Load the meeting store
    let store: Arc<dyn MeetingStore> = match &config.meetings_file {
        Some(path) => {
            info!(path = %path.display(), "Loading meetings file...");
            let store = InMemoryMeetingStore::from_json_file(path).map_err(|e| {
                error!(error = %e, path = %path.display(), "Failed to load meetings file");
                e
            })?;
            info!(meetings = store.meeting_count().await, "Meeting store loaded");
            Arc::new(store)
        }
        None => {
            warn!("MC_MEETINGS_FILE not set, starting with an empty meeting store");
            Arc::new(InMemoryMeetingStore::new())
        }
    };

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let health_state = Arc::new(HealthState::new(Arc::clone(&actor_metrics)));
    let controller_handle = MeetingControllerActorHandle::new(
        ControllerConfig::from_config(&config),
        store,
        Arc::clone(&actor_metrics),
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    // This provides liveness/readiness probes and Prometheus /metrics endpoint
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let app = health_router(Arc::clone(&health_state)).merge(metrics_router(prometheus_handle));

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_state = Arc::new(SignalingState {
        controller: controller_handle.clone(),
        config: TransportConfig::from_config(&config),
    });
    let signaling_app = signaling_router(signaling_state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_server = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(listener, signaling_app).with_graceful_shutdown(async move {
            signaling_shutdown_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_serving();
    info!("Meeting Controller running - press Ctrl+C to shutdown");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Readiness drops before rooms start closing
    health_state.set_draining();

    // Rooms close their connections, which ends every open socket
    if let Err(e) = controller_handle.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();

    for (name, task) in [("signaling", signaling_server), ("health", health_server)] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(server = name, "Server did not stop in time");
        }
    }

    info!(
        connections_remaining = actor_metrics.connection_count(),
        "Meeting Controller shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
