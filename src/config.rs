//! Configuration loading and constants.
//!
//! Loads the server configuration from TOML files and defines defaults for
//! the listen address, self-signed certificate location, shutdown timeout
//! and logging. `AppConfig` is the root configuration struct.

use const_format::formatcp;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// =============================================================================
// Listener Defaults
// =============================================================================

/// Default interface to bind
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default HTTPS port
pub const DEFAULT_PORT: u16 = 8443;

/// Default listen address (compile-time string concatenation)
pub const DEFAULT_LISTEN: &str = formatcp!("{}:{}", DEFAULT_HOST, DEFAULT_PORT);

/// Hostname embedded in generated certificates when none is configured
pub const DEFAULT_HOSTNAME: &str = "localhost";

// =============================================================================
// TLS and Shutdown Defaults
// =============================================================================

/// Base path of the self-signed fallback pair (`.crt` and `.key` are appended)
pub const DEFAULT_SELF_SIGNED_BASE: &str = "tls/self-signed";

/// Seconds to wait for in-flight requests before forcing the listener closed
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = formatcp!("{}=info", env!("CARGO_CRATE_NAME"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Listener and TLS configuration
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP(S) listener configuration.
///
/// Resolved once before startup and treated as immutable afterwards. When
/// `insecure` is set the certificate and key paths are ignored entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address to bind, as `host:port`
    #[serde(default = "HttpConfig::default_listen")]
    pub listen: String,
    /// PEM certificate chain. `None` selects the self-signed fallback.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`
    pub key_file: Option<PathBuf>,
    /// Identity placed in generated self-signed certificates
    #[serde(default = "HttpConfig::default_hostname")]
    pub hostname: String,
    /// Serve plain HTTP
    #[serde(default)]
    pub insecure: bool,
    /// Where the self-signed fallback pair lives
    #[serde(default = "HttpConfig::default_self_signed_base")]
    pub self_signed_base: PathBuf,
    /// Graceful drain bound used on SIGINT/SIGTERM
    #[serde(default = "HttpConfig::default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            cert_file: None,
            key_file: None,
            hostname: Self::default_hostname(),
            insecure: false,
            self_signed_base: Self::default_self_signed_base(),
            shutdown_timeout_seconds: Self::default_shutdown_timeout(),
        }
    }
}

impl HttpConfig {
    fn default_listen() -> String {
        DEFAULT_LISTEN.to_string()
    }

    fn default_hostname() -> String {
        DEFAULT_HOSTNAME.to_string()
    }

    fn default_self_signed_base() -> PathBuf {
        PathBuf::from(DEFAULT_SELF_SIGNED_BASE)
    }

    fn default_shutdown_timeout() -> u64 {
        DEFAULT_SHUTDOWN_TIMEOUT_SECS
    }

    /// Configuration for a plaintext listener on `listen`.
    pub fn insecure(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            insecure: true,
            ..Self::default()
        }
    }

    /// Graceful drain bound as a `Duration`
    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "http.listen must not be empty".to_string(),
            ));
        }
        if self.insecure {
            return Ok(());
        }
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => Err(ConfigError::Validation(
                "http.cert_file is set but http.key_file is missing".to_string(),
            )),
            (None, Some(_)) => Err(ConfigError::Validation(
                "http.key_file is set but http.cert_file is missing".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl AppConfig {
    /// Parse a TOML file. Call [`validate`](Self::validate) once overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = ConfigError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(contents)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
