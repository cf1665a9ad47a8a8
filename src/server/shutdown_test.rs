//! Tests for graceful shutdown handling

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_shutdown_channel_initially_not_shutdown() {
    let (_controller, signal) = shutdown_channel();

    assert!(!signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_channel_triggers_shutdown() {
    let (controller, signal) = shutdown_channel();

    controller.shutdown();

    assert!(signal.is_shutdown());
}

/// Test that wait completes when shutdown is triggered
#[tokio::test]
async fn test_shutdown_wait_completes_on_signal() {
    let (controller, signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;

    assert!(
        result.is_ok(),
        "wait() should complete when shutdown triggered"
    );
    assert!(signal.is_shutdown());
}

/// Child tokens handed to control loops are cancelled with the process token
#[tokio::test]
async fn test_shutdown_cancels_child_tokens() {
    let (controller, signal) = shutdown_channel();
    let loop_a = signal.token().child_token();
    let loop_b = signal.token().child_token();

    // Cancelling one loop leaves the rest running
    loop_a.cancel();
    assert!(!loop_b.is_cancelled());
    assert!(!signal.is_shutdown());

    controller.shutdown();

    assert!(loop_b.is_cancelled());
}

#[tokio::test]
async fn test_shutdown_signal_clones_share_state() {
    let (controller, signal) = shutdown_channel();
    let signal2 = signal.clone();

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(signal2.is_shutdown());
}
