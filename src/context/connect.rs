//! CONNECT tunnels: opaque relay, TLS interception or upgrade sniffing.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → handle_upgrade ? "established" + peek preamble
//!     → Upgrade token           → UPGRADE_SNIFF   (plain internal listener)
//!     → decrypt_https           → HTTPS_INTERCEPT (TLS internal listener)
//!     → otherwise               → STREAMING       (StreamContext to host:port)
//!
//! internal listener: client tunnel ⇄ bridge socket ⇄ hyper http1
//!     → HttpContext / HttpUpgradeContext children (parent = this context)
//! ```
//!
//! # Design Decisions
//! - Outbound failures on the streaming path surface before "established"
//! - The peeked preamble is replayed byte for byte on every branch
//! - One private listener per CONNECT, closed after its single accept

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::context::stream::StreamContext;
use crate::context::{ConnectionContext, ContextEnv, ContextError, ContextKind, ContextMeta};
use crate::http::message::{split_host_port, RequestView};
use crate::http::service::{serve_connection, ServeOptions};
use crate::net::listener::bind_internal;
use crate::net::port::{ListenerKind, PortLease};
use crate::net::socket::BoxSocket;
use crate::net::upstream::{self, UpstreamProxy};
use crate::observability::metrics;
use crate::tls::{self, CertificateError};

/// Upper bound on the bytes buffered while looking for an `Upgrade` header.
const PREAMBLE_MAX_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBranch {
    Streaming,
    HttpsIntercept,
    UpgradeSniff,
}

impl ConnectBranch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectBranch::Streaming => "streaming",
            ConnectBranch::HttpsIntercept => "https_intercept",
            ConnectBranch::UpgradeSniff => "upgrade_sniff",
        }
    }
}

#[derive(Debug, Default)]
struct TunnelState {
    established: bool,
    head: BytesMut,
}

pub struct HttpConnectContext {
    meta: Arc<ContextMeta>,
    env: ContextEnv,
    request: RequestView,
    local: Option<BoxSocket>,
    tunnel: TunnelState,
    decrypt_https: bool,
    handle_upgrade: bool,
    upstream_proxy: Option<UpstreamProxy>,
    branch: Option<ConnectBranch>,
}

impl HttpConnectContext {
    /// `head` holds client bytes already read past the CONNECT request.
    pub fn new(meta: Arc<ContextMeta>, request: RequestView, local: BoxSocket, head: Bytes, env: ContextEnv) -> Self {
        let decrypt_https = env.flags.decrypt_https;
        let handle_upgrade = env.flags.handle_upgrade;
        let upstream_proxy = env.upstream_proxy.clone();
        Self {
            meta,
            env,
            request,
            local: Some(local),
            tunnel: TunnelState {
                established: false,
                head: BytesMut::from(&head[..]),
            },
            decrypt_https,
            handle_upgrade,
            upstream_proxy,
            branch: None,
        }
    }

    pub fn meta(&self) -> &Arc<ContextMeta> {
        &self.meta
    }

    pub fn request(&self) -> &RequestView {
        &self.request
    }

    pub fn set_decrypt_https(&mut self, decrypt: bool) {
        self.decrypt_https = decrypt;
    }

    pub fn set_handle_upgrade(&mut self, handle: bool) {
        self.handle_upgrade = handle;
    }

    pub fn set_upstream_proxy(&mut self, proxy: Option<UpstreamProxy>) {
        self.upstream_proxy = proxy;
    }

    /// Client bytes to replay in front of the relayed stream.
    pub fn head(&self) -> &[u8] {
        &self.tunnel.head
    }

    pub fn is_established(&self) -> bool {
        self.tunnel.established
    }

    /// The branch taken, once decided.
    pub fn branch(&self) -> Option<ConnectBranch> {
        self.branch
    }

    /// `host` and `port` of the CONNECT target; the port defaults to 443.
    pub fn target(&self) -> Result<(String, u16), ContextError> {
        let (host, port) = split_host_port(self.request.target());
        if host.is_empty() {
            return Err(ContextError::ProtocolViolation(format!(
                "invalid CONNECT target: {:?}",
                self.request.target()
            )));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| {
                ContextError::ProtocolViolation(format!("invalid CONNECT port: {port}"))
            })?,
            None => 443,
        };
        Ok((host.to_owned(), port))
    }

    /// Writes the success line once; later calls do nothing.
    pub async fn send_established(&mut self) -> Result<(), ContextError> {
        if self.tunnel.established {
            return Ok(());
        }
        let local = self
            .local
            .as_mut()
            .ok_or_else(|| ContextError::ProtocolViolation("tunnel already relayed".to_owned()))?;
        let line = format!("HTTP/{} 200 OK\r\n\r\n", self.request.http_version());
        local.write_all(line.as_bytes()).await.map_err(ContextError::local)?;
        local.flush().await.map_err(ContextError::local)?;
        self.tunnel.established = true;
        Ok(())
    }

    /// Picks the branch, sniffing the client preamble when upgrades are handled.
    pub async fn decide(&mut self) -> Result<ConnectBranch, ContextError> {
        if let Some(branch) = self.branch {
            return Ok(branch);
        }
        let mut branch = if self.decrypt_https {
            ConnectBranch::HttpsIntercept
        } else {
            ConnectBranch::Streaming
        };
        if self.handle_upgrade {
            self.send_established().await?;
            self.peek_preamble().await?;
            if has_upgrade_token(&self.tunnel.head) {
                branch = ConnectBranch::UpgradeSniff;
            }
        }
        self.branch = Some(branch);
        Ok(branch)
    }

    /// Buffers client bytes while they still look like an HTTP head.
    async fn peek_preamble(&mut self) -> Result<(), ContextError> {
        let local = self
            .local
            .as_mut()
            .ok_or_else(|| ContextError::ProtocolViolation("tunnel already relayed".to_owned()))?;
        let head = &mut self.tunnel.head;
        loop {
            let looks_like_http = head.first().map_or(true, u8::is_ascii_uppercase);
            let complete = head.windows(4).any(|w| w == b"\r\n\r\n");
            if !looks_like_http || complete || head.len() >= PREAMBLE_MAX_SIZE {
                return Ok(());
            }
            let n = local.read_buf(head).await.map_err(ContextError::local)?;
            if n == 0 {
                if head.is_empty() {
                    return Err(ContextError::local(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "client closed the tunnel before sending data",
                    )));
                }
                return Ok(());
            }
        }
    }

    pub async fn connect(&mut self) -> Result<(), ContextError> {
        let branch = self.decide().await?;
        metrics::record_connect_branch(branch.as_str());
        tracing::debug!(
            context_id = %self.meta.id(),
            target = %self.request.target(),
            branch = branch.as_str(),
            "CONNECT branch selected"
        );
        match branch {
            ConnectBranch::Streaming => self.stream().await,
            ConnectBranch::HttpsIntercept | ConnectBranch::UpgradeSniff => self.intercept(branch).await,
        }
    }

    async fn stream(&mut self) -> Result<(), ContextError> {
        let (host, port) = self.target()?;
        let remote = upstream::connect_tunnel(&host, port, self.upstream_proxy.as_ref(), &self.env.tls).await?;
        self.send_established().await?;

        let local = self.take_local()?;
        let head = std::mem::take(&mut self.tunnel.head).freeze();
        let mut stream = StreamContext::with_remote(ContextMeta::child(ContextKind::Stream, &self.meta), local, remote, head);
        stream.set_local_timeout(self.env.timeouts.local);
        stream.set_remote_timeout(self.env.timeouts.remote);
        self.env.process(ConnectionContext::Stream(stream)).await
    }

    async fn intercept(&mut self, branch: ConnectBranch) -> Result<(), ContextError> {
        let (kind, engine) = match branch {
            ConnectBranch::HttpsIntercept => {
                let engine = self.env.certificates.clone().ok_or_else(|| {
                    CertificateError::Unavailable("no certificate engine configured".to_owned())
                })?;
                (ListenerKind::Https, Some(engine))
            }
            _ => (ListenerKind::Upgrade, None),
        };

        let lease = PortLease::acquire(&self.env.ports, kind);
        let listener = bind_internal(self.env.internal_host, lease.port())
            .await
            .map_err(ContextError::InternalListener)?;
        let address = listener.local_addr().map_err(ContextError::InternalListener)?;
        let internal = TcpStream::connect(address)
            .await
            .map_err(ContextError::InternalListener)?;
        self.send_established().await?;

        let local = self.take_local()?;
        let head = std::mem::take(&mut self.tunnel.head).freeze();
        let options = ServeOptions {
            env: self.env.clone(),
            client_addr: self.meta.client_addr(),
            encrypted: engine.is_some(),
            parent: Some(Arc::clone(&self.meta)),
            upgrades: branch == ConnectBranch::UpgradeSniff || self.handle_upgrade,
            authenticator: None,
        };

        tokio::try_join!(bridge(local, internal, head), serve_internal(listener, engine, options))?;
        drop(lease);
        Ok(())
    }

    fn take_local(&mut self) -> Result<BoxSocket, ContextError> {
        self.local
            .take()
            .ok_or_else(|| ContextError::ProtocolViolation("tunnel already relayed".to_owned()))
    }
}

impl fmt::Debug for HttpConnectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnectContext")
            .field("meta", &self.meta)
            .field("target", &self.request.target())
            .field("established", &self.tunnel.established)
            .field("head_len", &self.tunnel.head.len())
            .field("decrypt_https", &self.decrypt_https)
            .field("handle_upgrade", &self.handle_upgrade)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

/// Case-insensitive `upgrade` followed by optional whitespace (line breaks
/// included) and a colon.
fn has_upgrade_token(bytes: &[u8]) -> bool {
    const TOKEN: &[u8] = b"upgrade";
    bytes.windows(TOKEN.len()).enumerate().any(|(at, window)| {
        window.eq_ignore_ascii_case(TOKEN)
            && bytes[at + TOKEN.len()..].iter().find(|b| !b.is_ascii_whitespace()) == Some(&b':')
    })
}

/// Pipes the client tunnel into the internal listener, head first.
async fn bridge(mut local: BoxSocket, mut internal: TcpStream, head: Bytes) -> Result<(), ContextError> {
    if !head.is_empty() {
        internal.write_all(&head).await.map_err(ContextError::InternalListener)?;
    }
    let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut internal)
        .await
        .map_err(ContextError::local)?;
    tracing::trace!(bytes_sent = sent, bytes_received = received, "Tunnel bridge closed");
    Ok(())
}

/// Serves the single bridged connection, terminating TLS when an engine is given.
async fn serve_internal(
    listener: TcpListener,
    engine: Option<Arc<dyn tls::CertificateEngine>>,
    options: ServeOptions,
) -> Result<(), ContextError> {
    let (socket, _) = listener.accept().await.map_err(ContextError::InternalListener)?;
    drop(listener);
    let _ = socket.set_nodelay(true);
    let socket: BoxSocket = match engine {
        Some(engine) => Box::new(tls::accept(socket, engine.as_ref()).await?),
        None => Box::new(socket),
    };
    serve_connection(socket, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::http::headers::HeaderList;
    use hyper::{Method, Version};

    fn context(local: tokio::io::DuplexStream, head: &'static [u8]) -> HttpConnectContext {
        let request = RequestView::new(Method::CONNECT, "example.test:8443", Version::HTTP_11, HeaderList::new());
        let meta = ContextMeta::new(ContextKind::HttpConnect, testing::client(), None);
        HttpConnectContext::new(meta, request, Box::new(local), Bytes::from_static(head), testing::env())
    }

    #[test]
    fn upgrade_token_detection() {
        assert!(has_upgrade_token(b"GET / HTTP/1.1\r\nUPGRADE : websocket\r\n\r\n"));
        assert!(has_upgrade_token(b"PATCH /x\r\nUpgrade: foo\r\n\r\n"));
        assert!(has_upgrade_token(b"GET / HTTP/1.1\r\nupgrade\r\n: websocket\r\n\r\n"));
        assert!(has_upgrade_token(b"GET / HTTP/1.1\r\nUpgrade \n\t:x\r\n\r\n"));
        assert!(!has_upgrade_token(b"GET /upgrade HTTP/1.1\r\n\r\n"));
        assert!(!has_upgrade_token(b"\x16\x03\x01"));
    }

    #[test]
    fn target_defaults_to_443() {
        let (local, _client) = tokio::io::duplex(64);
        let mut ctx = context(local, b"");
        assert_eq!(ctx.target().unwrap(), ("example.test".to_owned(), 8443));
        ctx.request = RequestView::new(Method::CONNECT, "[::1]", Version::HTTP_11, HeaderList::new());
        assert_eq!(ctx.target().unwrap(), ("::1".to_owned(), 443));
    }

    #[tokio::test]
    async fn established_is_written_once() {
        let (local, mut client) = tokio::io::duplex(256);
        let mut ctx = context(local, b"");
        ctx.send_established().await.unwrap();
        ctx.send_established().await.unwrap();
        assert!(ctx.is_established());
        drop(ctx);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn sniffed_preamble_is_kept_verbatim() {
        let (local, mut client) = tokio::io::duplex(256);
        let mut ctx = context(local, b"PATCH /x\r\n");
        ctx.set_handle_upgrade(true);

        client.write_all(b"Upgrade: foo\r\n\r\n").await.unwrap();
        let branch = ctx.decide().await.unwrap();
        assert_eq!(branch, ConnectBranch::UpgradeSniff);
        assert_eq!(ctx.head(), b"PATCH /x\r\nUpgrade: foo\r\n\r\n");

        let mut line = [0u8; 19];
        client.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn non_http_preamble_falls_through() {
        let (local, mut client) = tokio::io::duplex(256);
        let mut ctx = context(local, b"");
        ctx.set_handle_upgrade(true);

        client.write_all(b"\x16\x03\x01\x00\x05hello").await.unwrap();
        assert_eq!(ctx.decide().await.unwrap(), ConnectBranch::Streaming);
        assert_eq!(ctx.head(), b"\x16\x03\x01\x00\x05hello");
    }

    #[tokio::test]
    async fn intercept_without_engine_fails_before_established() {
        let (local, mut client) = tokio::io::duplex(256);
        let mut ctx = context(local, b"");
        ctx.set_decrypt_https(true);
        let err = ctx.connect().await.unwrap_err();
        assert_eq!(err.label(), "certificate");
        assert!(!ctx.is_established());
        drop(ctx);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }
}
