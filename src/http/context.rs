//! Per-request cancellation contexts.
//!
//! Every request runs under a [`RequestContext`] whose token is a child of the
//! server's shutdown scope. Cancelling the scope cancels every live request
//! context. A request context is cancelled on its own when the request
//! finishes or when hyper drops the request future (client disconnect), and
//! that never reaches the scope or a sibling request.
//!
//! The middleware also opens the request span, so all logs emitted while
//! handling a request carry its `request_id`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use http::request::Parts;
use http::StatusCode;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use tracing::Instrument;
use uuid::Uuid;

/// Cancellation context handed to request handlers.
///
/// Extract it in a handler like any other axum extractor:
///
/// ```ignore
/// async fn slow(ctx: RequestContext) -> &'static str {
///     tokio::select! {
///         _ = ctx.cancelled() => "cancelled",
///         _ = do_work() => "done",
///     }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct RequestContext {
    id: Uuid,
    token: CancellationToken,
}

impl RequestContext {
    /// Derive a fresh context from the shutdown scope.
    pub fn derive(scope: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: scope.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope or this request is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Cancel this request only.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token for handing to spawned work that should stop with the request.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestContext>().cloned().ok_or_else(|| {
            tracing::error!("RequestContext extracted on a router without a bound scope");
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}

/// Binds a shutdown scope to every request served by a router.
#[derive(Clone, Debug)]
pub struct ScopeBinding {
    scope: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl ScopeBinding {
    pub fn new(scope: CancellationToken) -> Self {
        Self {
            scope,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of request contexts that have not been retired yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wrap `router` so each request runs under a context derived from the scope.
    ///
    /// This should be the outermost layer so the request span and context
    /// cover all other middleware.
    pub fn bind(&self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(
            self.clone(),
            bind_request_context,
        ))
    }

    fn track(&self, ctx: &RequestContext) -> Retire {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Retire {
            _cancel: ctx.token.clone().drop_guard(),
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Retires a request context when the request completes or is dropped.
struct Retire {
    _cancel: DropGuard,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Retire {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn bind_request_context(
    State(binding): State<ScopeBinding>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::derive(&binding.scope);
    let retire = binding.track(&ctx);

    let span = tracing::info_span!(
        "request",
        request_id = %ctx.id(),
        method = %request.method(),
        path = %request.uri().path(),
        duration_ms = tracing::field::Empty,
    );

    let start = Instant::now();
    request.extensions_mut().insert(ctx.clone());

    async move {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms,
            cancelled = ctx.is_cancelled(),
            "Request completed"
        );

        drop(retire);
        response
    }
    .instrument(span)
    .await
}
