//! Shared mock upstreams and proxy bootstrap for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use intercept_proxy::config::ProxyConfig;
use intercept_proxy::net::listener::Listener;
use intercept_proxy::net::upstream::{ProxyProtocol, UpstreamProxy};
use intercept_proxy::{ProxyServer, Shutdown};

/// A running proxy; dropping it stops the accept loop.
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: Shutdown,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Starts a proxy on an ephemeral port. `customize` adds handlers, engines, …
pub async fn start_proxy<F>(mut config: ProxyConfig, customize: F) -> TestProxy
where
    F: FnOnce(ProxyServer) -> ProxyServer,
{
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = customize(ProxyServer::new(config).unwrap());
    let shutdown = Shutdown::new();
    tokio::spawn(server.run(listener, None, shutdown.subscribe()));
    TestProxy { addr, shutdown }
}

async fn read_head(socket: &mut TcpStream) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        seen.extend_from_slice(&buf[..n]);
    }
    seen
}

/// Origin answering every request with `body`; request heads are reported on the channel.
pub async fn start_mock_backend(body: &'static str) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Backend: mock\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });
    (addr, rx)
}

/// Stands in for an upstream proxy; request heads are reported on the channel.
///
/// `CONNECT` gets `connect_status` and, on `200`, a relay to the requested
/// target. Any other request is answered `200` with the body `via upstream`.
pub async fn start_upstream_proxy(connect_status: u16) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let seen = read_head(&mut socket).await;
                let Some(end) = seen.windows(4).position(|w| w == b"\r\n\r\n") else {
                    return;
                };
                let head = String::from_utf8_lossy(&seen[..end + 4]).into_owned();
                let _ = tx.send(head.clone());

                let Some(target) = head.strip_prefix("CONNECT ").and_then(|line| line.split(' ').next()) else {
                    let body = "via upstream";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                    return;
                };
                if connect_status != 200 {
                    let response = format!("HTTP/1.1 {connect_status} Refused\r\nContent-Length: 0\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                    return;
                }
                let Ok(mut origin) = TcpStream::connect(target).await else {
                    return;
                };
                let _ = origin.write_all(&seen[end + 4..]).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await;
                let _ = tokio::io::copy_bidirectional(&mut socket, &mut origin).await;
            });
        }
    });
    (addr, rx)
}

/// Default config whose outbound traffic goes through the plain-HTTP proxy at `upstream`.
pub fn through_upstream(upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.upstream_proxy = Some(UpstreamProxy::new("127.0.0.1", upstream.port(), ProxyProtocol::Http));
    config
}

/// Echoes raw bytes back.
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Answers an `Upgrade: foo` request with 101, then echoes raw bytes.
pub async fn start_upgrade_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                socket
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: foo\r\n\r\n")
                    .await
                    .unwrap();
                let (mut rd, mut wr) = socket.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo)
}

/// WebSocket echo server at `/ws`.
pub async fn start_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/ws", get(ws_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Sends `CONNECT target` and consumes the success line.
pub async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut socket = TcpStream::connect(proxy).await.unwrap();
    socket
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut line = [0u8; 19];
    socket.read_exact(&mut line).await.unwrap();
    assert_eq!(&line, b"HTTP/1.1 200 OK\r\n\r\n");
    socket
}

/// Reads until `needle` shows up or the stream ends.
pub async fn read_until<S>(socket: &mut S, needle: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut seen = Vec::new();
    let mut buf = [0u8; 1024];
    let read = async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), read).await;
    seen
}
