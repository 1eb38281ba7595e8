//! Gatehouse - a lifecycle-managed HTTP(S) server
//!
//! Serves an axum router over plain HTTP or TLS, binds the server's lifetime
//! to a cancellation scope propagated into every request, and resolves TLS
//! material from explicit files or a generated self-signed fallback.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod tls;

pub use app::run;
pub use error::{Error, Result};
