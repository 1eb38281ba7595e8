use crate::config::ConfigError;
use crate::http::ServerError;
use crate::tls::CertificateError;

/// Any failure that stops the application from serving.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Certificate resolution failed: {0}")]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
