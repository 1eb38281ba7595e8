//! Application runner.
//!
//! Resolves TLS material, builds the server around the given router, installs
//! the signal drain and serves until the server stops.

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::Result;
use crate::http::{drain_on_signal, HttpServer, StopCause};
use crate::tls::ensure_certificate;

/// Serve `router` with `config` until a signal or `scope` stops the server.
pub async fn run(config: HttpConfig, router: Router, scope: CancellationToken) -> Result<StopCause> {
    if config.insecure && (config.cert_file.is_some() || config.key_file.is_some()) {
        tracing::warn!("Insecure mode enabled, ignoring configured certificate and key files");
    }

    let certificate = ensure_certificate(&config, &config.self_signed_base)?;
    let timeout = config.shutdown_timeout();

    let server = HttpServer::new(config, router, certificate);
    let drain = drain_on_signal(server.clone(), scope.clone(), timeout);

    let result = server.start(scope).await;

    // The drain task outlives a stop that did not come from a signal
    drain.abort();
    if let Err(e) = drain.await {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "Signal drain task failed");
        }
    }

    Ok(result?)
}
