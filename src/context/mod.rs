//! Connection contexts: one per proxied exchange.
//!
//! # Data Flow
//! ```text
//! dispatcher
//!     → HttpContext          (plain request/response)
//!     → HttpUpgradeContext   → WebSocketSessionContext | StreamContext
//!     → HttpConnectContext   → StreamContext
//!                            → internal listener → HttpContext / HttpUpgradeContext
//!
//! every context → ContextHandler → context.connect()
//! ```
//!
//! # Design Decisions
//! - One tagged enum, one operation: `connect()`
//! - Children point at their parent through a `Weak`, never owning it
//! - Everything a context needs from the process lives in `ContextEnv`

pub mod connect;
pub mod deflate;
pub mod error;
pub mod http;
pub mod stream;
pub mod upgrade;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::net::connection::ContextId;
use crate::net::port::{EphemeralPorts, PortAllocator};
use crate::net::upstream::UpstreamProxy;
use crate::observability::metrics;
use crate::tls::{CertificateEngine, TlsClient};

pub use connect::{ConnectBranch, HttpConnectContext};
pub use error::{ContextError, FrameError, Side};
pub use self::http::HttpContext;
pub use stream::StreamContext;
pub use upgrade::HttpUpgradeContext;
pub use websocket::{Frame, FrameFlags, FrameTransform, Next, WebSocketSessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Http,
    HttpConnect,
    HttpUpgrade,
    Stream,
    WebSocketSession,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Http => "http",
            ContextKind::HttpConnect => "http_connect",
            ContextKind::HttpUpgrade => "http_upgrade",
            ContextKind::Stream => "stream",
            ContextKind::WebSocketSession => "websocket_session",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity shared by every context.
#[derive(Debug)]
pub struct ContextMeta {
    id: ContextId,
    kind: ContextKind,
    client: SocketAddr,
    parent: Option<Weak<ContextMeta>>,
}

impl ContextMeta {
    pub fn new(kind: ContextKind, client: SocketAddr, parent: Option<&Arc<ContextMeta>>) -> Arc<Self> {
        metrics::record_context(kind.as_str());
        Arc::new(Self {
            id: ContextId::next(),
            kind,
            client,
            parent: parent.map(Arc::downgrade),
        })
    }

    /// Child of `parent`, inheriting its client address.
    pub fn child(kind: ContextKind, parent: &Arc<ContextMeta>) -> Arc<Self> {
        Self::new(kind, parent.client, Some(parent))
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client
    }

    pub fn client_address(&self) -> IpAddr {
        self.client.ip()
    }

    pub fn client_port(&self) -> u16 {
        self.client.port()
    }

    /// The context this one was spawned from, if it is still alive.
    pub fn parent(&self) -> Option<Arc<ContextMeta>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }
}

/// A proxied exchange, ready for a processor to inspect and `connect()`.
#[derive(Debug)]
pub enum ConnectionContext {
    Http(HttpContext),
    HttpConnect(HttpConnectContext),
    HttpUpgrade(HttpUpgradeContext),
    Stream(StreamContext),
    WebSocketSession(WebSocketSessionContext),
}

impl ConnectionContext {
    pub fn meta(&self) -> &Arc<ContextMeta> {
        match self {
            ConnectionContext::Http(c) => c.meta(),
            ConnectionContext::HttpConnect(c) => c.meta(),
            ConnectionContext::HttpUpgrade(c) => c.meta(),
            ConnectionContext::Stream(c) => c.meta(),
            ConnectionContext::WebSocketSession(c) => c.meta(),
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.meta().kind()
    }

    /// Performs the whole exchange.
    pub async fn connect(&mut self) -> Result<(), ContextError> {
        match self {
            ConnectionContext::Http(c) => c.connect().await,
            ConnectionContext::HttpConnect(c) => c.connect().await,
            ConnectionContext::HttpUpgrade(c) => c.connect().await,
            ConnectionContext::Stream(c) => c.connect().await,
            ConnectionContext::WebSocketSession(c) => c.connect().await,
        }
    }
}

/// The processing callback every context is handed to.
pub trait ContextHandler: Send + Sync + 'static {
    fn handle(&self, context: ConnectionContext) -> BoxFuture<'static, Result<(), ContextError>>;
}

impl<F, Fut> ContextHandler for F
where
    F: Fn(ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ContextError>> + Send + 'static,
{
    fn handle(&self, context: ConnectionContext) -> BoxFuture<'static, Result<(), ContextError>> {
        Box::pin(self(context))
    }
}

/// Default processor: connect every context untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectAll;

impl ContextHandler for ConnectAll {
    fn handle(&self, mut context: ConnectionContext) -> BoxFuture<'static, Result<(), ContextError>> {
        Box::pin(async move { context.connect().await })
    }
}

/// Interception switches applied to new contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptFlags {
    pub decrypt_https: bool,
    pub handle_upgrade: bool,
    pub handle_websocket: bool,
}

impl Default for InterceptFlags {
    fn default() -> Self {
        Self {
            decrypt_https: false,
            handle_upgrade: false,
            handle_websocket: true,
        }
    }
}

/// Per-side inactivity limits for byte streams. `None` disables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimeouts {
    pub local: Option<Duration>,
    pub remote: Option<Duration>,
}

impl Default for StreamTimeouts {
    fn default() -> Self {
        Self {
            local: Some(StreamContext::DEFAULT_TIMEOUT),
            remote: Some(StreamContext::DEFAULT_TIMEOUT),
        }
    }
}

/// Process-level collaborators shared by every context.
#[derive(Clone)]
pub struct ContextEnv {
    pub handler: Arc<dyn ContextHandler>,
    pub certificates: Option<Arc<dyn CertificateEngine>>,
    pub ports: Arc<dyn PortAllocator>,
    pub tls: TlsClient,
    pub upstream_proxy: Option<UpstreamProxy>,
    pub flags: InterceptFlags,
    pub timeouts: StreamTimeouts,
    pub internal_host: IpAddr,
}

impl ContextEnv {
    pub fn new(tls: TlsClient) -> Self {
        Self {
            handler: Arc::new(ConnectAll),
            certificates: None,
            ports: Arc::new(EphemeralPorts),
            tls,
            upstream_proxy: None,
            flags: InterceptFlags::default(),
            timeouts: StreamTimeouts::default(),
            internal_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn with_handler(mut self, handler: impl ContextHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Hands `context` to the processor on a new task, logging its failure.
    pub fn spawn(&self, context: ConnectionContext) {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(run_handler(handler, context));
    }

    /// Hands `context` to the processor and waits for it.
    pub async fn process(&self, context: ConnectionContext) -> Result<(), ContextError> {
        let id = context.meta().id();
        let kind = context.kind();
        let result = self.handler.handle(context).await;
        if let Err(e) = &result {
            metrics::record_context_error(kind.as_str(), e.label());
            tracing::debug!(context_id = %id, kind = kind.as_str(), error = %e, "Context failed");
        }
        result
    }
}

impl fmt::Debug for ContextEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEnv")
            .field("upstream_proxy", &self.upstream_proxy)
            .field("flags", &self.flags)
            .field("timeouts", &self.timeouts)
            .field("internal_host", &self.internal_host)
            .field("certificates", &self.certificates.is_some())
            .finish_non_exhaustive()
    }
}

async fn run_handler(handler: Arc<dyn ContextHandler>, context: ConnectionContext) {
    let id = context.meta().id();
    let kind = context.kind();
    let client = context.meta().client_addr();
    if let Err(e) = handler.handle(context).await {
        metrics::record_context_error(kind.as_str(), e.label());
        tracing::warn!(context_id = %id, kind = kind.as_str(), client = %client, error = %e, "Context failed");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_reference_parent_weakly() {
        let parent = ContextMeta::new(ContextKind::HttpConnect, testing::client(), None);
        let child = ContextMeta::child(ContextKind::Http, &parent);
        assert_eq!(child.client_port(), 50000);
        assert_eq!(child.parent().unwrap().id(), parent.id());

        drop(parent);
        assert!(child.has_parent());
        assert!(child.parent().is_none());
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler: Arc<dyn ContextHandler> = Arc::new(|context: ConnectionContext| async move {
            assert_eq!(context.kind(), ContextKind::Http);
            Ok(())
        });
        let (local, _pending) = crate::http::local::LocalResponse::channel();
        let meta = ContextMeta::new(ContextKind::Http, testing::client(), None);
        let request = crate::http::message::RequestView::new(
            hyper::Method::GET,
            "/",
            hyper::Version::HTTP_11,
            Default::default(),
        );
        let context = ConnectionContext::Http(HttpContext::new(meta, request, local, testing::env()));
        handler.handle(context).await.unwrap();
    }
}
