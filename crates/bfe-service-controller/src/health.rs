//! Health check HTTP server for Kubernetes probes.
//!
//! Serves a liveness and a readiness endpoint on configurable paths.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Shared state for health check endpoints.
#[derive(Debug)]
pub struct HealthState {
    /// When the probe server started listening.
    started_at: OnceLock<Instant>,
    /// How long readiness stays failing after start.
    unready: Duration,
}

impl HealthState {
    pub fn new(unready: Duration) -> Self {
        Self {
            started_at: OnceLock::new(),
            unready,
        }
    }

    /// Mark the controller as started. Later calls keep the first start time.
    pub fn mark_started(&self) {
        if self.started_at.set(Instant::now()).is_ok() {
            info!(
                unready_secs = self.unready.as_secs(),
                "Health check: controller marked as started"
            );
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.get().is_some()
    }

    /// Started, and the unready duration has elapsed since.
    pub fn is_ready(&self) -> bool {
        self.started_at
            .get()
            .is_some_and(|started| started.elapsed() >= self.unready)
    }
}

/// Run the health check HTTP server.
///
/// Runs until the server hits a fatal error. The controller is marked as
/// started only once the listener is bound.
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
    liveness_path: &str,
    readiness_path: &str,
) -> std::io::Result<()> {
    let app = Router::new()
        .route(liveness_path, get(healthz))
        .route(readiness_path, get(readyz))
        .with_state(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!(
        %addr,
        liveness = liveness_path,
        readiness = readiness_path,
        "Health check server listening"
    );

    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe: 200 while the process is serving.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe: 503 until started and past the unready duration.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if !state.is_ready() {
        debug!("Readiness probe: NOT READY (within unready duration)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}
