//! Outbound TLS towards origins.

use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::context::ContextError;
use crate::net::socket::{BoxSocket, Socket};
use crate::tls::CertificateError;

/// Cheaply cloneable TLS connector.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Verifies origins against the Mozilla root program.
    pub fn webpki() -> Result<Self, CertificateError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self, CertificateError> {
        let mut config = ClientConfig::builder_with_provider(super::provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Trusts only the certificates in `pem`. Handy for private CAs.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes())) {
            roots.add(cert?)?;
        }
        if roots.is_empty() {
            return Err(CertificateError::Missing("certificate"));
        }
        Self::with_roots(roots)
    }

    pub async fn connect<S>(&self, host: &str, socket: S) -> Result<BoxSocket, ContextError>
    where
        S: Socket + 'static,
    {
        let name = ServerName::try_from(host.to_owned()).map_err(|e| {
            ContextError::ProtocolViolation(format!("invalid server name {host}: {e}"))
        })?;
        let stream = self
            .connector
            .connect(name, socket)
            .await
            .map_err(ContextError::Tls)?;
        Ok(Box::new(stream))
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient").finish_non_exhaustive()
    }
}
