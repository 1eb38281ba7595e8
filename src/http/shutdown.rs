//! Operator signal handling.
//!
//! SIGTERM/SIGINT start a graceful drain bounded by the configured timeout.
//! If the drain does not finish in time the cancellation scope is cancelled,
//! which closes the listener and cancels every in-flight request context.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::server::HttpServer;

/// Drain `server` gracefully on SIGTERM or SIGINT, forcing closure on timeout.
///
/// Abort the returned task once the server has stopped.
pub fn drain_on_signal(
    server: HttpServer,
    scope: CancellationToken,
    timeout: Duration,
) -> JoinHandle<()> {
    drain_on(server, scope, timeout, wait_for_signal())
}

/// Drain `server` gracefully once `trigger` resolves, forcing closure on timeout.
///
/// The task exits without action if `scope` is cancelled first. If the drain
/// does not finish within `timeout` the scope is cancelled.
pub fn drain_on<F>(
    server: HttpServer,
    scope: CancellationToken,
    timeout: Duration,
    trigger: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = trigger => {}
            _ = scope.cancelled() => return,
        }

        match server.shutdown_with_timeout(&scope, timeout).await {
            Ok(()) => tracing::info!("Graceful shutdown complete"),
            Err(e) => {
                tracing::warn!(error = %e, "Forcing listener closed");
                scope.cancel();
            }
        }
    })
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c() => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
}
