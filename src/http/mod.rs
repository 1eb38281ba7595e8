//! HTTP server module with TLS support.
//!
//! This module provides a single-use HTTP(S) server whose lifetime is bound
//! to a cancellation scope:
//! - **TLS**: presents material resolved by [`crate::tls`]
//! - **Insecure**: plain HTTP, for development or behind a terminating proxy
//!
//! The server includes:
//! - Per-request contexts derived from the scope
//! - Graceful and timed shutdown
//! - Graceful drain on SIGTERM/SIGINT with forced closure on timeout

mod context;
mod server;
mod shutdown;

pub use context::{RequestContext, ScopeBinding};
pub use server::{HttpServer, Lifecycle, ServerError, ShutdownError, StopCause};
pub use shutdown::{drain_on, drain_on_signal};
