//! TLS certificate resolution.
//!
//! Resolves the certificate and key the HTTPS listener will present:
//! - Explicit: user-provided files, loaded and verified, never repaired
//! - Reused: a self-signed pair generated by a previous run
//! - Generated: a fresh self-signed pair written next to the configured base path
//!
//! Every [`CertificateMaterial`] is produced by parsing PEM from disk and
//! checking that the private key matches the leaf certificate.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::CertifiedKey;
use rustls::crypto::aws_lc_rs;
use rustls::sign::CertifiedKey as RustlsCertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::HttpConfig;

/// File permissions for generated PEM files (owner read/write only)
#[cfg(unix)]
const PRIVATE_FILE_MODE: u32 = 0o600;

/// Loopback name always covered by generated certificates
const LOOPBACK_NAME: &str = "localhost";

/// Which generated artifact failed to persist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Key,
    Certificate,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Key => f.write_str("key"),
            Artifact::Certificate => f.write_str("certificate"),
        }
    }
}

/// Certificate resolution error
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Certificate file {} given without a key file", cert.display())]
    MissingKeyFile { cert: PathBuf },

    #[error("Key file {} given without a certificate file", key.display())]
    MissingCertFile { key: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to parse PEM in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: rustls_pki_types::pem::Error,
    },

    #[error("No certificates found in {}", path.display())]
    Empty { path: PathBuf },

    #[error("Unsupported private key in {}: {source}", path.display())]
    UnsupportedKey { path: PathBuf, source: rustls::Error },

    #[error(
        "Private key {} does not match certificate {}: {source}",
        key.display(),
        cert.display()
    )]
    KeyMismatch {
        cert: PathBuf,
        key: PathBuf,
        source: rustls::Error,
    },

    #[error("Unrecognized error reading existing self-signed certificate: {0}")]
    InvalidExisting(#[source] Box<CertificateError>),

    #[error(
        "Incomplete self-signed pair: {} exists but {} does not",
        present.display(),
        missing.display()
    )]
    IncompletePair { present: PathBuf, missing: PathBuf },

    #[error("Failed to inspect {}: {source}", path.display())]
    Inspect { path: PathBuf, source: io::Error },

    #[error("Failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("Error writing {artifact} PEM to {}: {source}", path.display())]
    Persist {
        artifact: Artifact,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to build TLS server configuration: {0}")]
    ServerConfig(#[source] rustls::Error),
}

/// Where resolved material came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    /// Paths configured by the operator
    Provided,
    /// Self-signed pair left by a previous run
    Reused,
    /// Self-signed pair generated by this call
    Generated,
}

/// A verified certificate chain and matching private key.
#[derive(Debug)]
pub struct CertificateMaterial {
    cert_path: PathBuf,
    key_path: PathBuf,
    origin: CertificateOrigin,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertificateMaterial {
    /// Load a PEM pair from disk and verify the key matches the leaf certificate.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        origin: CertificateOrigin,
    ) -> Result<Self, CertificateError> {
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;

        let cert_chain = CertificateDer::pem_slice_iter(&cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CertificateError::Parse {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if cert_chain.is_empty() {
            return Err(CertificateError::Empty {
                path: cert_path.to_path_buf(),
            });
        }

        let key =
            PrivateKeyDer::from_pem_slice(&key_pem).map_err(|source| CertificateError::Parse {
                path: key_path.to_path_buf(),
                source,
            })?;

        let signing_key = aws_lc_rs::sign::any_supported_type(&key).map_err(|source| {
            CertificateError::UnsupportedKey {
                path: key_path.to_path_buf(),
                source,
            }
        })?;
        RustlsCertifiedKey::new(cert_chain.clone(), signing_key)
            .keys_match()
            .map_err(|source| CertificateError::KeyMismatch {
                cert: cert_path.to_path_buf(),
                key: key_path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            origin,
            cert_chain,
            key,
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn origin(&self) -> CertificateOrigin {
        self.origin
    }

    /// Build a rustls server configuration presenting this material.
    ///
    /// Uses the aws-lc-rs provider explicitly so the result does not depend on
    /// a process-wide default provider. ALPN advertises HTTP/2 and HTTP/1.1.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(CertificateError::ServerConfig)?
        .with_no_client_auth()
        .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
        .map_err(CertificateError::ServerConfig)?;

        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Resolve the certificate the HTTPS listener should present.
///
/// Returns `Ok(None)` without touching the filesystem in insecure mode. With
/// explicit paths the pair must load cleanly. Otherwise the pair at
/// `<default_base>.crt` / `<default_base>.key` is reused, or generated when
/// neither file exists.
pub fn ensure_certificate(
    config: &HttpConfig,
    default_base: &Path,
) -> Result<Option<CertificateMaterial>, CertificateError> {
    if config.insecure {
        return Ok(None);
    }

    // Files specified by the user must exist and hold a consistent pair
    match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => {
            return CertificateMaterial::load(cert, key, CertificateOrigin::Provided).map(Some);
        }
        (Some(cert), None) => {
            return Err(CertificateError::MissingKeyFile { cert: cert.clone() });
        }
        (None, Some(key)) => {
            return Err(CertificateError::MissingCertFile { key: key.clone() });
        }
        (None, None) => {}
    }

    tracing::warn!("No TLS keys provided, using self-signed certificate");

    let cert_path = with_suffix(default_base, ".crt");
    let key_path = with_suffix(default_base, ".key");

    match (exists(&cert_path)?, exists(&key_path)?) {
        (true, true) => {
            tracing::info!(
                cert = %cert_path.display(),
                key = %key_path.display(),
                "Reusing previously generated self-signed certificate"
            );
            CertificateMaterial::load(&cert_path, &key_path, CertificateOrigin::Reused)
                .map(Some)
                .map_err(|e| CertificateError::InvalidExisting(Box::new(e)))
        }
        (false, false) => {
            tracing::warn!(
                key = %key_path.display(),
                cert = %cert_path.display(),
                "Generating self-signed key and certificate"
            );
            generate_self_signed(&config.hostname, &cert_path, &key_path)?;
            CertificateMaterial::load(&cert_path, &key_path, CertificateOrigin::Generated).map(Some)
        }
        (true, false) => Err(CertificateError::IncompletePair {
            present: cert_path,
            missing: key_path,
        }),
        (false, true) => Err(CertificateError::IncompletePair {
            present: key_path,
            missing: cert_path,
        }),
    }
}

/// Names a generated certificate covers: the configured hostname and loopback.
fn subject_names(hostname: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(2);
    let hostname = hostname.trim();
    if !hostname.is_empty() && hostname != LOOPBACK_NAME {
        names.push(hostname.to_string());
    }
    names.push(LOOPBACK_NAME.to_string());
    names
}

fn generate_self_signed(
    hostname: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), CertificateError> {
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(subject_names(hostname))?;

    if let Some(parent) = key_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CertificateError::Persist {
            artifact: Artifact::Key,
            path: parent.to_path_buf(),
            source,
        })?;
    }

    write_private(key_path, key_pair.serialize_pem().as_bytes()).map_err(|source| {
        CertificateError::Persist {
            artifact: Artifact::Key,
            path: key_path.to_path_buf(),
            source,
        }
    })?;

    if let Err(source) = write_private(cert_path, cert.pem().as_bytes()) {
        // A lone key would block the next start with an incomplete pair
        if let Err(e) = fs::remove_file(key_path) {
            tracing::error!(error = %e, key = %key_path.display(), "Failed to remove orphaned key");
        }
        return Err(CertificateError::Persist {
            artifact: Artifact::Certificate,
            path: cert_path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

/// Create `path` exclusively and write `contents` with owner-only permissions.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn read(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn exists(path: &Path) -> Result<bool, CertificateError> {
    path.try_exists().map_err(|source| CertificateError::Inspect {
        path: path.to_path_buf(),
        source,
    })
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(base.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}
