//! Outbound legs: direct connections, upstream proxies and CONNECT tunnels.
//!
//! # Data Flow
//! ```text
//! secure origin + proxy:  TCP(proxy) [+TLS] → CONNECT host:port → 200 → TLS(origin)
//! plain origin + proxy:   TCP(proxy) [+TLS] → request in absolute-form
//! no proxy:               TCP(origin) [+TLS if secure]
//! ```

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::context::ContextError;
use crate::http::message::authority;
use crate::net::socket::BoxSocket;
use crate::tls::TlsClient;

const RESPONSE_HEAD_MAX_SIZE: usize = 8192;
pub const RESPONSE_MAX_HEADERS: usize = 32;

/// How the proxy itself is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
}

/// A further proxy all outbound traffic goes through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
}

impl UpstreamProxy {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// Parses `http://host:port` / `https://host:port`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let url = url::Url::parse(value).map_err(|e| e.to_string())?;
        let protocol = match url.scheme() {
            "http" => ProxyProtocol::Http,
            "https" => ProxyProtocol::Https,
            other => return Err(format!("unsupported proxy scheme {other}")),
        };
        let host = url
            .host_str()
            .ok_or_else(|| "proxy url has no host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| "proxy url has no port".to_string())?;
        Ok(Self::new(host, port, protocol))
    }

    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

/// An opened outbound socket and the peer it reached.
pub struct Remote {
    pub socket: BoxSocket,
    pub peer: Option<SocketAddr>,
}

/// Socket towards an origin plus the request-target form it expects.
pub struct OriginRoute {
    pub socket: BoxSocket,
    /// The socket leads to a proxy that expects an absolute-form target.
    pub absolute_form: bool,
}

async fn tcp(host: &str, port: u16) -> Result<(TcpStream, Option<SocketAddr>), ContextError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(ContextError::remote)?;
    let _ = stream.set_nodelay(true);
    let peer = stream.peer_addr().ok();
    Ok((stream, peer))
}

/// Connects to the upstream proxy itself, over TLS when it speaks HTTPS.
pub async fn open_proxy_socket(proxy: &UpstreamProxy, tls: &TlsClient) -> Result<Remote, ContextError> {
    let (stream, peer) = tcp(&proxy.host, proxy.port).await?;
    let socket = match proxy.protocol {
        ProxyProtocol::Http => Box::new(stream) as BoxSocket,
        ProxyProtocol::Https => tls.connect(&proxy.host, stream).await?,
    };
    Ok(Remote { socket, peer })
}

/// Reads a response head up to and including the blank line, byte by byte
/// so nothing past it is consumed. `what` names the request in errors.
pub async fn read_response_head<S>(socket: &mut S, what: &str) -> Result<Vec<u8>, ContextError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut one = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut one).await.map_err(ContextError::remote)?;
        if n == 0 {
            return Err(ContextError::remote(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed before the {what} response"),
            )));
        }
        buf.push(one[0]);
        if buf.len() > RESPONSE_HEAD_MAX_SIZE {
            return Err(ContextError::remote(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{what} response head too large"),
            )));
        }
    }
    Ok(buf)
}

/// Asks the proxy on `socket` to open a tunnel to `target`.
///
/// The response is read byte by byte so nothing past its head is consumed.
pub async fn establish_tunnel<S>(socket: &mut S, target: &str) -> Result<(), ContextError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    socket
        .write_all(request.as_bytes())
        .await
        .map_err(ContextError::remote)?;
    socket.flush().await.map_err(ContextError::remote)?;

    let buf = read_response_head(socket, "CONNECT").await?;

    let mut headers = [httparse::EMPTY_HEADER; RESPONSE_MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buf)
        .map_err(|e| ContextError::remote(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    match response.code {
        Some(200) => Ok(()),
        Some(status) => Err(ContextError::UpstreamProxy {
            target: target.to_owned(),
            status,
        }),
        None => Err(ContextError::remote(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty upstream proxy response",
        ))),
    }
}

/// A raw byte tunnel to `host:port`, through `proxy` when one is set.
pub async fn connect_tunnel(
    host: &str,
    port: u16,
    proxy: Option<&UpstreamProxy>,
    tls: &TlsClient,
) -> Result<Remote, ContextError> {
    match proxy {
        None => {
            let (stream, peer) = tcp(host, port).await?;
            Ok(Remote {
                socket: Box::new(stream),
                peer,
            })
        }
        Some(proxy) => {
            let mut remote = open_proxy_socket(proxy, tls).await?;
            establish_tunnel(&mut remote.socket, &authority(host, port)).await?;
            tracing::debug!(proxy = %proxy.authority(), target = %authority(host, port), "Upstream tunnel established");
            Ok(remote)
        }
    }
}

/// Opens the socket an HTTP request for `host:port` should be written to.
pub async fn connect_origin(
    host: &str,
    port: u16,
    secure: bool,
    proxy: Option<&UpstreamProxy>,
    tls: &TlsClient,
) -> Result<OriginRoute, ContextError> {
    if secure {
        let tunnel = connect_tunnel(host, port, proxy, tls).await?;
        let socket = tls.connect(host, tunnel.socket).await?;
        return Ok(OriginRoute {
            socket,
            absolute_form: false,
        });
    }
    match proxy {
        Some(proxy) => Ok(OriginRoute {
            socket: open_proxy_socket(proxy, tls).await?.socket,
            absolute_form: true,
        }),
        None => Ok(OriginRoute {
            socket: Box::new(tcp(host, port).await?.0),
            absolute_form: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_urls() {
        let proxy = UpstreamProxy::parse("https://proxy.local:3128").unwrap();
        assert_eq!(proxy, UpstreamProxy::new("proxy.local", 3128, ProxyProtocol::Https));
        assert_eq!(UpstreamProxy::parse("http://10.0.0.1").unwrap().port, 80);
        assert!(UpstreamProxy::parse("socks5://x:1").is_err());
    }

    #[tokio::test]
    async fn tunnel_requires_exactly_200() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = proxy.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = establish_tunnel(&mut client, "example.com:443").await.unwrap_err();
        assert!(matches!(err, ContextError::UpstreamProxy { status: 407, .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_leaves_trailing_bytes_unread() {
        let (mut client, mut proxy) = tokio::io::duplex(1024);
        proxy
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
            .await
            .unwrap();

        establish_tunnel(&mut client, "a:1").await.unwrap();
        let mut rest = [0u8; 5];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");
    }
}
