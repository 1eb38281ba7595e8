//! HTTP/HTTPS server lifecycle.
//!
//! Supports two listener modes:
//! - TLS: certificate material resolved by [`crate::tls::ensure_certificate`]
//! - Insecure: plain HTTP
//!
//! A server is started once. Its running period is bound to a cancellation
//! scope: cancelling the scope closes the listener abruptly and cancels every
//! in-flight request context. Graceful and timed shutdown are available
//! through any clone of the [`HttpServer`] handle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::tls::{CertificateError, CertificateMaterial};

use super::context::ScopeBinding;

/// Server startup or serve error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server already started; create a new instance to serve again")]
    AlreadyStarted,

    #[error("TLS requested but no certificate was resolved")]
    CertificateUnresolved,

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(#[from] CertificateError),

    #[error("Failed to bind server to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Server on {address} failed: {source}")]
    Serve {
        address: String,
        source: std::io::Error,
    },
}

/// Graceful shutdown error
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Graceful shutdown did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Graceful shutdown aborted before in-flight requests finished")]
    Aborted,
}

/// Lifecycle of a server instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Why a server stopped serving without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The scope passed to [`HttpServer::start`] was cancelled
    ScopeCancelled,
    /// [`HttpServer::shutdown`] drained the server
    Shutdown,
    /// [`HttpServer::close`] closed the server
    Closed,
}

/// Handle to a single-use HTTP(S) server.
///
/// Clones share the same server, so one task can block in [`start`](Self::start)
/// while another shuts it down.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: HttpConfig,
    certificate: Option<CertificateMaterial>,
    router: Mutex<Option<Router>>,
    handle: Handle,
    lifecycle: watch::Sender<Lifecycle>,
    stop_cause: Mutex<Option<StopCause>>,
    binding: Mutex<Option<ScopeBinding>>,
}

impl HttpServer {
    /// Create a server in the `Created` state.
    ///
    /// `certificate` is required unless `config.insecure` is set; pass the
    /// result of [`crate::tls::ensure_certificate`].
    pub fn new(config: HttpConfig, router: Router, certificate: Option<CertificateMaterial>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        Self {
            inner: Arc::new(Inner {
                config,
                certificate,
                router: Mutex::new(Some(router)),
                handle: Handle::new(),
                lifecycle,
                stop_cause: Mutex::new(None),
                binding: Mutex::new(None),
            }),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.borrow()
    }

    /// Address the listener is bound to, once it is accepting connections.
    ///
    /// Returns `None` if the server stops before it starts listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut lifecycle = self.inner.lifecycle.subscribe();
        tokio::select! {
            biased;
            addr = self.inner.handle.listening() => addr,
            _ = lifecycle.wait_for(|state| *state == Lifecycle::Stopped) => None,
        }
    }

    /// Number of requests whose context has not been retired yet.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.binding)
            .as_ref()
            .map(ScopeBinding::in_flight)
            .unwrap_or(0)
    }

    /// Serve until the scope is cancelled or the server is shut down or closed.
    ///
    /// Every request runs under a context derived from `scope`. Returns the
    /// cause for designed stops and an error for any bind or serve failure.
    pub async fn start(&self, scope: CancellationToken) -> Result<StopCause, ServerError> {
        let started = self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Created {
                *state = Lifecycle::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ServerError::AlreadyStarted);
        }

        let result = self.serve(scope).await;
        self.inner.lifecycle.send_replace(Lifecycle::Stopped);

        match &result {
            Ok(cause) => tracing::info!(?cause, "HTTP server terminated"),
            Err(e) => tracing::error!(error = %e, "HTTP server terminated"),
        }
        result
    }

    async fn serve(&self, scope: CancellationToken) -> Result<StopCause, ServerError> {
        let router = lock(&self.inner.router)
            .take()
            .ok_or(ServerError::AlreadyStarted)?;

        let tls = match (&self.inner.certificate, self.inner.config.insecure) {
            (_, true) => None,
            (Some(material), false) => Some(RustlsConfig::from_config(material.server_config()?)),
            (None, false) => return Err(ServerError::CertificateUnresolved),
        };

        let address = self.inner.config.listen.clone();
        let listener = bind(&address).await?;

        let binding = ScopeBinding::new(scope.clone());
        let app = binding.bind(router);
        *lock(&self.inner.binding) = Some(binding);

        let serving = CancellationToken::new();
        let watcher = tokio::spawn(close_on_scope(
            scope,
            serving.clone(),
            self.clone(),
        ));

        let handle = self.inner.handle.clone();
        let result = match tls {
            None => {
                tracing::info!(%address, "Starting insecure HTTP server");
                axum_server::from_tcp(listener)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            }
            Some(tls) => {
                let material = self.inner.certificate.as_ref();
                tracing::info!(
                    %address,
                    cert = ?material.map(|m| m.cert_path().display().to_string()),
                    origin = ?material.map(CertificateMaterial::origin),
                    "Starting secure HTTPS server"
                );
                axum_server::tls_rustls::from_tcp_rustls(listener, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            }
        };

        serving.cancel();
        if let Err(e) = watcher.await {
            tracing::error!(error = %e, "Scope watcher failed");
        }

        result.map_err(|source| ServerError::Serve { address, source })?;
        let cause = *lock(&self.inner.stop_cause);
        Ok(cause.unwrap_or(StopCause::Shutdown))
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    ///
    /// `Ok` means the server has reached `Stopped`, not that it served
    /// successfully: a server whose `start` failed to bind is already stopped.
    /// Read the outcome of serving from [`start`](Self::start).
    ///
    /// Returns [`ShutdownError::Aborted`] if `deadline` is cancelled first.
    /// The server keeps draining in that case; escalate with [`close`](Self::close).
    pub async fn shutdown(&self, deadline: &CancellationToken) -> Result<(), ShutdownError> {
        self.record_stop(StopCause::Shutdown);

        let never_started = self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Created {
                *state = Lifecycle::Stopped;
                true
            } else {
                false
            }
        });
        if never_started {
            return Ok(());
        }

        tracing::info!("Graceful shutdown initiated, waiting for connections to close");
        self.inner.handle.graceful_shutdown(None);

        let mut lifecycle = self.inner.lifecycle.subscribe();
        tokio::select! {
            _ = lifecycle.wait_for(|state| *state == Lifecycle::Stopped) => Ok(()),
            _ = deadline.cancelled() => Err(ShutdownError::Aborted),
        }
    }

    /// [`shutdown`](Self::shutdown) bounded by `timeout`, and by `parent` being cancelled.
    pub async fn shutdown_with_timeout(
        &self,
        parent: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), ShutdownError> {
        let deadline = parent.child_token();
        let _release = deadline.clone().drop_guard();

        match tokio::time::timeout(timeout, self.shutdown(&deadline)).await {
            Ok(result) => result,
            Err(_) => Err(ShutdownError::Timeout(timeout)),
        }
    }

    /// Close the listener and every open connection immediately.
    pub fn close(&self) {
        self.record_stop(StopCause::Closed);
        self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Created {
                *state = Lifecycle::Stopped;
                true
            } else {
                false
            }
        });
        self.inner.handle.shutdown();
    }

    fn record_stop(&self, cause: StopCause) {
        *lock(&self.inner.stop_cause) = Some(cause);
    }
}

/// Close the server abruptly when the scope is cancelled.
///
/// Exits without action once serving has ended for any other reason.
async fn close_on_scope(scope: CancellationToken, serving: CancellationToken, server: HttpServer) {
    tokio::select! {
        _ = scope.cancelled() => {
            tracing::info!("Cancellation scope fired, closing listener");
            server.record_stop(StopCause::ScopeCancelled);
            server.inner.handle.shutdown();
        }
        _ = serving.cancelled() => {}
    }
}

async fn bind(address: &str) -> Result<std::net::TcpListener, ServerError> {
    let bind_error = |source| ServerError::Bind {
        address: address.to_string(),
        source,
    };

    // tokio leaves the std listener in non-blocking mode
    tokio::net::TcpListener::bind(address)
        .await
        .and_then(|listener| listener.into_std())
        .map_err(bind_error)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
