//! TLS session factory.
//!
//! # Responsibilities
//! - Load the PEM certificate chain and private key once per service
//! - Fail at build time when key material is missing or unusable
//! - Hand out a fresh server-mode session per accepted connection
//!
//! # Design Decisions
//! - The private key file is the secret; rustls has no keystore password
//! - Sessions are never shared: `TlsAcceptor::accept` creates one per stream
//! - Only server-mode negotiation is configured, with ALPN `http/1.1`

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::schema::TlsConfig;

/// Errors raised while preparing TLS key material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate chain path is not set")]
    MissingCertificate,

    #[error("private key path is not set")]
    MissingPrivateKey,

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("cannot build TLS context: {0}")]
    Context(#[from] rustls::Error),
}

/// Builds per-connection TLS sessions from one shared server context.
#[derive(Clone)]
pub struct TlsSessionFactory {
    config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSessionFactory")
            .field("alpn_protocols", &self.config.alpn_protocols)
            .finish()
    }
}

impl TlsSessionFactory {
    /// Load key material and build the server context.
    pub fn new(tls: &TlsConfig) -> Result<Self, TlsError> {
        let certificate =
            non_empty(tls.certificate.as_deref()).ok_or(TlsError::MissingCertificate)?;
        let private_key =
            non_empty(tls.private_key.as_deref()).ok_or(TlsError::MissingPrivateKey)?;

        let chain = load_certificates(certificate)?;
        let key = load_private_key(private_key)?;

        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tracing::info!(certificate = %certificate.display(), "TLS context initialized");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// A fresh server-mode session acceptor for one connection.
    pub fn create(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
