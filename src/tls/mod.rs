//! Server TLS context for the broker listener.
//!
//! Client certificates are required; a peer whose certificate does not chain
//! to the trust bundle is rejected during the handshake, before any MQTT
//! packet is read. Protocols are pinned to TLS 1.3 and TLS 1.2. The same
//! context serves the optional HTTPS admin surface.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("trust store {0} contains no usable anchors")]
    EmptyTrustStore(String),

    #[error("client verifier construction failed: {0}")]
    Verifier(String),

    #[error("TLS configuration rejected: {0}")]
    Config(String),
}

/// Fully constructed server-side TLS material.
#[derive(Clone)]
pub struct TlsContext {
    server_config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Builds the mTLS server context from the PEM material on disk.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        // Several dependencies carry their own rustls provider features; pin
        // the process default once.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let certs = read_certs(&config.cert_path)?;
        let key = read_private_key(&config.key_path)?;
        let roots = read_trust_anchors(&config.ca_path)?;

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;

        let server_config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;

        info!(
            cert = %config.cert_path.display(),
            ca = %config.ca_path.display(),
            "TLS context built, client authentication required, protocols TLSv1.3/TLSv1.2"
        );

        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.display().to_string()));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

fn read_trust_anchors(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut reader = open(path)?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        roots
            .add(cert)
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyTrustStore(path.display().to_string()));
    }
    Ok(roots)
}
