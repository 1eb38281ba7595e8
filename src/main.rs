//! Gatehouse: a lifecycle-managed HTTP(S) server.
//!
//! This is the application entry point. It parses the command line, loads
//! configuration from an optional TOML file, initializes tracing, and serves a
//! liveness endpoint until SIGTERM/SIGINT.

use std::path::PathBuf;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::config::{AppConfig, LogFormat, DEFAULT_LOG_FILTER};

/// Gatehouse: serve HTTP(S) with a self-signed fallback certificate
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (e.g., "gatehouse=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Address to listen on (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// PEM certificate file
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// PEM private key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Hostname embedded in a generated self-signed certificate
    #[arg(long)]
    hostname: Option<String>,

    /// Serve plain HTTP
    #[arg(long)]
    insecure: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(self, config: &mut AppConfig) {
        let http = &mut config.http;
        if let Some(listen) = self.listen {
            http.listen = listen;
        }
        if let Some(cert_file) = self.cert_file {
            http.cert_file = Some(cert_file);
        }
        if let Some(key_file) = self.key_file {
            http.key_file = Some(key_file);
        }
        if let Some(hostname) = self.hostname {
            http.hostname = hostname;
        }
        http.insecure |= self.insecure;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = Args::parse();

    let mut config = match args.config.take() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .take()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter, config.logging.format);

    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        listen = %config.http.listen,
        insecure = config.http.insecure,
        hostname = %config.http.hostname,
        "Loaded configuration"
    );

    let router = Router::new().route("/health", get(|| async { "ok" }));
    let cause = gatehouse::run(config.http, router, CancellationToken::new()).await?;
    tracing::info!(?cause, "Exiting");

    Ok(())
}

fn init_tracing(filter: &str, format: LogFormat) {
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
