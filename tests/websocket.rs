//! Upgrades on the plain listener: WebSocket frame relay and generic switches.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use intercept_proxy::config::ProxyConfig;
use intercept_proxy::context::{Frame, FrameError, FrameTransform, Next};
use intercept_proxy::ConnectionContext;

mod common;

struct DropBinary;

impl FrameTransform for DropBinary {
    fn transform<'a>(&'a self, frame: &'a mut Frame, next: Next<'a>) -> BoxFuture<'a, Result<(), FrameError>> {
        Box::pin(async move {
            if frame.flags.binary {
                return Ok(());
            }
            next.run(frame).await
        })
    }
}

#[tokio::test]
async fn websocket_echo_through_proxy() {
    let backend = common::start_ws_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let socket = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(format!("ws://{backend}/ws"), socket)
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::text("hello")).await.unwrap();
    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("hello"));
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::binary(vec![1u8, 2, 3]));
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn incoming_transform_drops_binary_frames() {
    let backend = common::start_ws_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| {
        s.with_handler(|context: ConnectionContext| async move {
            match context {
                ConnectionContext::WebSocketSession(mut session) => {
                    session.incoming(DropBinary);
                    session.connect().await
                }
                mut other => other.connect().await,
            }
        })
    })
    .await;

    let socket = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(format!("ws://{backend}/ws"), socket)
        .await
        .unwrap();

    ws.send(Message::binary(vec![9u8; 4])).await.unwrap();
    ws.send(Message::text("first text")).await.unwrap();
    ws.send(Message::binary(vec![7u8; 4])).await.unwrap();
    ws.send(Message::text("second text")).await.unwrap();

    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("first text"));
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("second text"));
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn bad_websocket_version_is_rejected() {
    let backend = common::start_ws_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {backend}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 7\r\n\r\n"
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let response = common::read_until(&mut socket, b"\r\n\r\n").await;
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.to_ascii_lowercase().contains("connection: close"));
}

#[tokio::test]
async fn generic_upgrade_becomes_a_byte_stream() {
    let backend = common::start_upgrade_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("GET /tunnel HTTP/1.1\r\nHost: {backend}\r\nConnection: Upgrade\r\nUpgrade: foo\r\n\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();

    let head = common::read_until(&mut socket, b"\r\n\r\n").await;
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: foo"));

    socket.write_all(b"raw bytes after switch").await.unwrap();
    let echoed = common::read_until(&mut socket, b"switch").await;
    assert_eq!(echoed, b"raw bytes after switch");
}

fn inflate_message(payload: &[u8]) -> Vec<u8> {
    let mut input = payload.to_vec();
    input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);
    let mut out = Vec::with_capacity(1024);
    flate2::Decompress::new(false)
        .decompress_vec(&input, &mut out, flate2::FlushDecompress::Sync)
        .unwrap();
    out
}

#[tokio::test]
async fn permessage_deflate_is_negotiated_with_the_client() {
    let backend = common::start_ws_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let mut socket = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {backend}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n"
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let head = String::from_utf8(common::read_until(&mut socket, b"\r\n\r\n").await).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(
        head.to_ascii_lowercase()
            .contains("sec-websocket-extensions: permessage-deflate"),
        "{head}"
    );

    // Compressed, masked text frame carrying "Hello".
    let key = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![0xc1, 0x80 | 0x07];
    frame.extend_from_slice(&key);
    frame.extend(
        [0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4]),
    );
    socket.write_all(&frame).await.unwrap();

    // The origin declined compression; the echo still reaches the client compressed.
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0xc1, "final text frame with RSV1");
    assert_eq!(header[1] & 0x80, 0, "unmasked");
    let mut payload = vec![0u8; usize::from(header[1] & 0x7f)];
    socket.read_exact(&mut payload).await.unwrap();
    assert_eq!(inflate_message(&payload), b"Hello");
}

#[tokio::test]
async fn deflate_is_not_enabled_unless_offered() {
    let backend = common::start_ws_echo().await;
    let proxy = common::start_proxy(ProxyConfig::default(), |s| s).await;

    let socket = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(format!("ws://{backend}/ws"), socket)
        .await
        .unwrap();
    assert!(response.headers().get("sec-websocket-extensions").is_none());
    ws.send(Message::text("plain")).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("plain"));
}

#[tokio::test]
async fn outbound_websocket_is_tunnelled_through_upstream_proxy() {
    let backend = common::start_ws_echo().await;
    let (upstream, mut heads) = common::start_upstream_proxy(200).await;
    let proxy = common::start_proxy(common::through_upstream(upstream), |s| s).await;

    let socket = TcpStream::connect(proxy.addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(format!("ws://{backend}/ws"), socket)
        .await
        .unwrap();
    ws.send(Message::text("via upstream")).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("via upstream"));

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with(&format!("CONNECT {backend} HTTP/1.1\r\n")), "{head}");
}
