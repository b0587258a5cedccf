//! The dispatcher: accept loop and per-connection classification.
//!
//! # Data Flow
//! ```text
//! Listener::accept (bounded by max_connections)
//!     → head.rs reads the first request head
//!     → CONNECT  → authenticate(Connect) → HttpConnectContext → handler
//!     → anything → replay head → http::service (keep-alive, upgrades)
//!                  → authenticate(Request | Upgrade) per request
//!                  → HttpContext | HttpUpgradeContext → handler
//! ```
//!
//! # Design Decisions
//! - Live settings sit behind one `ArcSwap`; a connection keeps the snapshot it started with
//! - A reload that fails to load its certificate keeps the previous settings

mod head;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::config::ProxyConfig;
use crate::context::{
    ConnectAll, ConnectionContext, ContextEnv, ContextHandler, ContextKind, ContextMeta, HttpConnectContext,
    InterceptFlags, StreamTimeouts,
};
use crate::http::service::{serve_connection, ServeOptions, PROXY_AUTHENTICATE_VALUE};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::net::port::{EphemeralPorts, InvalidPortRange, PortAllocator, PortRange};
use crate::net::socket::Rewind;
use crate::security::{AuthPhase, Authenticator, BasicCredentials};
use crate::tls::{CertificateEngine, CertificateError, StaticCertificates, TlsClient};

use head::{read_head, reject, HeadError};

/// How long shutdown waits for open connections.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    PortRange(#[from] InvalidPortRange),
}

/// Everything a new connection needs, swapped as a whole on reload.
struct Live {
    config: ProxyConfig,
    /// Loaded from `config.tls`.
    certificates: Option<Arc<dyn CertificateEngine>>,
    ports: Arc<dyn PortAllocator>,
    env: ContextEnv,
    authenticator: Option<Arc<dyn Authenticator>>,
}

/// Forward proxy server.
pub struct ProxyServer {
    live: ArcSwap<Live>,
    handler: Arc<dyn ContextHandler>,
    tls: TlsClient,
    custom_authenticator: Option<Arc<dyn Authenticator>>,
    custom_certificates: Option<Arc<dyn CertificateEngine>>,
    custom_ports: Option<Arc<dyn PortAllocator>>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let tls = TlsClient::webpki()?;
        let handler: Arc<dyn ContextHandler> = Arc::new(ConnectAll);
        let certificates = load_certificates(&config)?;
        let ports = port_allocator(&config)?;
        let server = Self {
            live: ArcSwap::from_pointee(Live {
                env: ContextEnv::new(tls.clone()),
                config,
                certificates,
                ports,
                authenticator: None,
            }),
            handler,
            tls,
            custom_authenticator: None,
            custom_certificates: None,
            custom_ports: None,
            tracker: ConnectionTracker::new(),
        };
        server.refresh();
        Ok(server)
    }

    /// Processing callback every context is handed to.
    pub fn with_handler(mut self, handler: impl ContextHandler) -> Self {
        self.handler = Arc::new(handler);
        self.refresh();
        self
    }

    /// Replaces the `[auth]` section policy.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.custom_authenticator = Some(Arc::new(authenticator));
        self.refresh();
        self
    }

    /// Replaces the `[tls]` section certificate.
    pub fn with_certificates(mut self, engine: impl CertificateEngine) -> Self {
        self.custom_certificates = Some(Arc::new(engine));
        self.refresh();
        self
    }

    pub fn with_port_allocator(mut self, ports: impl PortAllocator) -> Self {
        self.custom_ports = Some(Arc::new(ports));
        self.refresh();
        self
    }

    /// Client used for outbound TLS (origins and HTTPS upstream proxies).
    pub fn with_tls_client(mut self, tls: TlsClient) -> Self {
        self.tls = tls;
        self.refresh();
        self
    }

    pub fn config(&self) -> ProxyConfig {
        self.live.load().config.clone()
    }

    /// Snapshot of the collaborators new contexts receive.
    pub fn env(&self) -> ContextEnv {
        self.live.load().env.clone()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Swaps in a new configuration for connections accepted afterwards.
    /// The listener address is not rebound.
    pub fn apply_config(&self, config: ProxyConfig) -> Result<(), ServerError> {
        let current = self.live.load_full();
        let certificates = if config.tls == current.config.tls {
            current.certificates.clone()
        } else {
            load_certificates(&config)?
        };
        let ports = if config.internal_listeners.port_range == current.config.internal_listeners.port_range {
            Arc::clone(&current.ports)
        } else {
            port_allocator(&config)?
        };
        if config.listener != current.config.listener {
            tracing::warn!("Listener settings changed; they apply after a restart");
        }
        self.live.store(Arc::new(self.assemble(config, certificates, ports)));
        tracing::info!("Configuration applied");
        Ok(())
    }

    fn refresh(&self) {
        let current = self.live.load_full();
        let live = self.assemble(
            current.config.clone(),
            current.certificates.clone(),
            Arc::clone(&current.ports),
        );
        self.live.store(Arc::new(live));
    }

    fn assemble(
        &self,
        config: ProxyConfig,
        certificates: Option<Arc<dyn CertificateEngine>>,
        ports: Arc<dyn PortAllocator>,
    ) -> Live {
        let env = ContextEnv {
            handler: Arc::clone(&self.handler),
            certificates: self.custom_certificates.clone().or_else(|| certificates.clone()),
            ports: self.custom_ports.clone().unwrap_or_else(|| Arc::clone(&ports)),
            tls: self.tls.clone(),
            upstream_proxy: config.upstream_proxy.clone(),
            flags: InterceptFlags {
                decrypt_https: config.interception.decrypt_https,
                handle_upgrade: config.interception.handle_upgrade,
                handle_websocket: config.interception.handle_websocket,
            },
            timeouts: StreamTimeouts {
                local: config.timeouts.local(),
                remote: config.timeouts.remote(),
            },
            internal_host: config
                .internal_listeners
                .bind_host
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };
        let authenticator = self.custom_authenticator.clone().or_else(|| {
            config.auth.as_ref().map(|auth| {
                Arc::new(BasicCredentials::new(&auth.username, &auth.password)) as Arc<dyn Authenticator>
            })
        });
        Live {
            config,
            certificates,
            ports,
            env,
            authenticator,
        }
    }

    /// Serves until `shutdown` fires, then waits for open connections.
    pub async fn run(
        self,
        listener: Listener,
        mut config_updates: Option<mpsc::UnboundedReceiver<ProxyConfig>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let server = Arc::new(self);
        tracing::info!(address = ?listener.local_addr().ok(), "Proxy server starting");

        loop {
            let next_update = async {
                match config_updates.as_mut() {
                    Some(updates) => updates.recv().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, client, permit)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            let _permit = permit;
                            let _guard = server.tracker.track();
                            server.handle_connection(stream, client).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(config) = next_update => {
                    if let Err(e) = server.apply_config(config) {
                        tracing::error!(error = %e, "Failed to apply config, keeping current configuration");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
            }
        }

        if !server.tracker.drain(DRAIN_DEADLINE).await {
            tracing::warn!(
                active = server.tracker.active_count(),
                "Connections still open after drain deadline"
            );
        }
        tracing::info!("Proxy server stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, client: SocketAddr) {
        let live = self.live.load_full();
        let mut buf = BytesMut::with_capacity(4096);

        let head = match read_head(&mut stream, &mut buf).await {
            Ok(Some(Ok(head))) => head,
            Ok(Some(Err(HeadError::Malformed))) => {
                tracing::debug!(client = %client, "Malformed request head");
                reject(&mut stream, "400 Bad Request", &[]).await;
                return;
            }
            Ok(Some(Err(HeadError::TooLarge))) => {
                reject(&mut stream, "431 Request Header Fields Too Large", &[]).await;
                return;
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(client = %client, error = %e, "Client failed before sending a request");
                return;
            }
        };

        if !head.is_connect() {
            let socket = Rewind::new(stream, buf.freeze());
            let options = ServeOptions {
                env: live.env.clone(),
                client_addr: client,
                encrypted: false,
                parent: None,
                upgrades: true,
                authenticator: live.authenticator.clone(),
            };
            if let Err(e) = serve_connection(Box::new(socket), options).await {
                tracing::debug!(client = %client, error = %e, "Client connection ended with error");
            }
            return;
        }

        let request = head.request;
        if let Some(authenticator) = &live.authenticator {
            if !authenticator.authenticate(&request, AuthPhase::Connect) {
                tracing::info!(client = %client, target = %request.target(), "Proxy authentication failed");
                reject(
                    &mut stream,
                    "407 Proxy Authentication Required",
                    &[("Proxy-Authenticate", PROXY_AUTHENTICATE_VALUE)],
                )
                .await;
                return;
            }
        }

        let leftover = buf.split_off(head.len).freeze();
        let meta = ContextMeta::new(ContextKind::HttpConnect, client, None);
        tracing::debug!(context_id = %meta.id(), client = %client, target = %request.target(), "CONNECT");
        let context = HttpConnectContext::new(meta, request, Box::new(stream), leftover, live.env.clone());
        if let Err(e) = live.env.process(ConnectionContext::HttpConnect(context)).await {
            tracing::warn!(client = %client, error = %e, "CONNECT failed");
        }
    }
}

fn load_certificates(config: &ProxyConfig) -> Result<Option<Arc<dyn CertificateEngine>>, ServerError> {
    match &config.tls {
        Some(tls) => {
            let engine = StaticCertificates::load(Path::new(&tls.cert_path), Path::new(&tls.key_path))?;
            Ok(Some(Arc::new(engine)))
        }
        None => Ok(None),
    }
}

fn port_allocator(config: &ProxyConfig) -> Result<Arc<dyn PortAllocator>, InvalidPortRange> {
    let ports: Arc<dyn PortAllocator> = match config.internal_listeners.port_range {
        Some([start, end]) => Arc::new(PortRange::new(start, end)?),
        None => Arc::new(EphemeralPorts),
    };
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    #[test]
    fn reload_swaps_flags_and_auth() {
        let server = ProxyServer::new(ProxyConfig::default()).unwrap();
        assert!(!server.env().flags.handle_upgrade);
        assert!(server.live.load().authenticator.is_none());

        let mut config = ProxyConfig::default();
        config.interception.handle_upgrade = true;
        config.timeouts.remote_socket_secs = 0;
        config.auth = Some(AuthConfig {
            username: "user".into(),
            password: "secret".into(),
        });
        server.apply_config(config).unwrap();

        let env = server.env();
        assert!(env.flags.handle_upgrade);
        assert_eq!(env.timeouts.remote, None);
        assert!(server.live.load().authenticator.is_some());
    }

    #[test]
    fn inverted_port_range_is_an_error_not_a_panic() {
        let mut config = ProxyConfig::default();
        config.internal_listeners.port_range = Some([5000, 4000]);
        assert!(matches!(ProxyServer::new(config.clone()), Err(ServerError::PortRange(_))));

        let server = ProxyServer::new(ProxyConfig::default()).unwrap();
        assert!(matches!(server.apply_config(config), Err(ServerError::PortRange(_))));
    }

    #[test]
    fn failed_certificate_load_keeps_current_config() {
        let server = ProxyServer::new(ProxyConfig::default()).unwrap();
        let mut config = ProxyConfig::default();
        config.interception.decrypt_https = true;
        config.tls = Some(crate::config::TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        });
        assert!(server.apply_config(config).is_err());
        assert!(!server.env().flags.decrypt_https);
    }
}
