//! Health check and metrics endpoints, plus the HTTP server hosting the control API
//!
//! - `/healthz` - Liveness: Is the process alive?
//! - `/readyz` - Readiness: Is the controller ready to handle requests?
//! - `/metrics` - Prometheus metrics in text format
//! - `/api/v1/rollouts...` - Control API (see `api`)

use crate::controller::Orchestrator;
use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for readiness tracking
///
/// Set to ready once the orchestrator is wired up; cleared on shutdown so
/// the pod stops receiving traffic while it drains.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    /// Create a new readiness state (initially not ready)
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Combined server state for every route
#[derive(Clone)]
pub struct ServerState {
    pub readiness: ReadinessState,
    pub metrics: SharedMetrics,
    pub orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    pub fn new(
        readiness: ReadinessState,
        metrics: SharedMetrics,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            readiness,
            metrics,
            orchestrator,
        }
    }
}

/// Liveness probe handler
///
/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe handler
async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics handler
async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    state.orchestrator.refresh_gauges().await;

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Build the router for health, metrics and control API endpoints
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .merge(super::api::routes())
        .with_state(state)
}

/// Serve every endpoint on `port` until `shutdown` fires
pub async fn run_server(
    port: u16,
    state: ServerState,
    shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    // Log after successful bind - server is actually listening
    info!(port = %port, "Control API, health and metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
