//! Certificate pairs and the engine that hands them out.

use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read certificate material: {0}")]
    Io(#[from] io::Error),

    #[error("no {0} found in PEM input")]
    Missing(&'static str),

    #[error("invalid certificate: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("no certificate available for {0}")]
    Unavailable(String),
}

/// PEM encoded key and certificate chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub key: String,
    pub cert: String,
}

impl CertificatePair {
    pub fn new(key: impl Into<String>, cert: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
        }
    }

    /// Reads both files as PEM text.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let cert = std::fs::read_to_string(cert_path)?;
        let key = std::fs::read_to_string(key_path)?;
        let pair = Self { key, cert };
        pair.parse()?;
        Ok(pair)
    }

    fn parse(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CertificateError> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(self.cert.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(CertificateError::Missing("certificate"));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(self.key.as_bytes()))?
            .ok_or(CertificateError::Missing("private key"))?;
        Ok((certs, key))
    }

    /// Server config presenting this pair, ALPN pinned to HTTP/1.1.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, CertificateError> {
        let (certs, key) = self.parse()?;
        let mut config = ServerConfig::builder_with_provider(super::provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// Source of certificates for TLS interception. Caching and issuance are up
/// to the implementation.
pub trait CertificateEngine: Send + Sync + 'static {
    /// Identity of the internal listener, used when the client sends no SNI.
    fn internal_cert(&self) -> BoxFuture<'_, Result<CertificatePair, CertificateError>>;

    /// Certificate to present for `server_name`.
    fn certificate<'a>(
        &'a self,
        server_name: &'a str,
    ) -> BoxFuture<'a, Result<CertificatePair, CertificateError>>;
}

/// Presents one pair for every server name, typically loaded from disk.
#[derive(Debug, Clone)]
pub struct StaticCertificates {
    pair: CertificatePair,
}

impl StaticCertificates {
    pub fn new(pair: CertificatePair) -> Self {
        Self { pair }
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertificateError> {
        let pair = CertificatePair::load(cert_path, key_path)?;
        tracing::info!(cert = %cert_path.display(), "Loaded interception certificate");
        Ok(Self { pair })
    }
}

impl CertificateEngine for StaticCertificates {
    fn internal_cert(&self) -> BoxFuture<'_, Result<CertificatePair, CertificateError>> {
        Box::pin(async move { Ok(self.pair.clone()) })
    }

    fn certificate<'a>(
        &'a self,
        server_name: &'a str,
    ) -> BoxFuture<'a, Result<CertificatePair, CertificateError>> {
        Box::pin(async move {
            tracing::trace!(server_name, "Serving static certificate");
            Ok(self.pair.clone())
        })
    }
}
