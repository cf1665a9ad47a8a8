//! HTTP server for the control API, health and metrics endpoints
//!
//! Provides Kubernetes health probes:
//! - `/healthz` - Liveness probe (process is running)
//! - `/readyz` - Readiness probe (controller is ready to serve)
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod api;
mod health;
pub mod metrics;
pub mod shutdown;

pub use health::{build_router, run_server, ReadinessState, ServerState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "api_test.rs"]
mod api_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
