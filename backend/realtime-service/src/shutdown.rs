/// Process shutdown: signal handling and the close-then-stop sequence
use actix_web::dev::ServerHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the registry gets to send close frames before the server stops.
pub const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler; waiting for Ctrl+C only");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Close every WebSocket session, then stop the HTTP server.
///
/// Sessions close while the server's workers still run, so every connection
/// actor can write its close frame before the listener goes away.
pub async fn close_sessions_then_stop(
    root: &CancellationToken,
    registry_task: JoinHandle<()>,
    server: ServerHandle,
) {
    tracing::info!("closing websocket sessions");
    root.cancel();

    match tokio::time::timeout(SESSION_DRAIN_TIMEOUT, registry_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "registry task failed"),
        Err(_) => tracing::warn!("timed out waiting for websocket sessions to close"),
    }

    tracing::info!("stopping HTTP server");
    server.stop(true).await;
}
