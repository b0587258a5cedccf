//! Server-side handshake with certificate selection by SNI.

use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::context::ContextError;
use crate::tls::CertificateEngine;

/// Completes a TLS handshake, asking `engine` for the certificate matching the
/// client's SNI (or the internal identity when none was sent).
pub async fn accept<S>(socket: S, engine: &dyn CertificateEngine) -> Result<TlsStream<S>, ContextError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), socket)
        .await
        .map_err(ContextError::Tls)?;

    let server_name = start.client_hello().server_name().map(str::to_owned);
    let pair = match server_name.as_deref() {
        Some(name) => engine.certificate(name).await?,
        None => engine.internal_cert().await?,
    };
    tracing::debug!(server_name = ?server_name, "Client hello received");

    let config = pair.server_config()?;
    start.into_stream(config).await.map_err(ContextError::Tls)
}
