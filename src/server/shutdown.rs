//! Graceful shutdown handling for the kanari controller
//!
//! SIGTERM/SIGINT cancel the process shutdown token. The HTTP server drains
//! and every rollout control loop, holding a child token, stops at its next
//! tick boundary.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Receiving side of the shutdown token
#[derive(Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Wait for shutdown to be triggered
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Check if shutdown was signaled (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token cancelled on shutdown; hand out children to long-running tasks
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Controller for triggering shutdown
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.token.cancel();
        info!("Shutdown signal sent");
    }
}

/// Create a new shutdown signal pair
///
/// Returns (controller, signal) where:
/// - controller: Used to trigger shutdown
/// - signal: Cloned and passed to components that need to listen
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let token = CancellationToken::new();
    (
        ShutdownController {
            token: token.clone(),
        },
        ShutdownSignal { token },
    )
}

/// Wait for SIGTERM or SIGINT signal
///
/// Returns the name of the signal received, or an error when the handlers
/// cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

/// Wait for Ctrl+C signal (Windows)
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok("CTRL_C")
}
