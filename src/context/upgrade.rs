//! Upgrade requests: WebSocket handshakes and opaque protocol switches.
//!
//! # Data Flow
//! ```text
//! Upgrade: websocket (+ handle_websocket)
//!     → validate key/version → 101 to client → outbound ws(s) handshake
//!     → [permessage-deflate on each leg that agreed to it]
//!     → WebSocketSessionContext → handler
//! any other Upgrade
//!     → forward request → 101 ? mirror + StreamContext (no timeouts) → handler
//!                       : mirror response like plain HTTP
//! ```

use std::fmt::{self, Write as _};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::WebSocketStream;

use crate::context::deflate::{self, DeflateSocket};
use crate::context::http::{outbound_request, send, write_response};
use crate::context::stream::StreamContext;
use crate::context::websocket::{WebSocketSessionContext, WsStream};
use crate::context::{ConnectionContext, ContextEnv, ContextError, ContextKind, ContextMeta, Side};
use crate::http::headers::{is_hop_by_hop, HeaderList};
use crate::http::local::LocalResponse;
use crate::http::message::{authority, Body, RequestView, ResponseView};
use crate::net::socket::BoxSocket;
use crate::net::upstream::{self, Remote, UpstreamProxy};

/// Outcome of validating a client WebSocket handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketNegotiation {
    pub accept: String,
    pub protocol: Option<String>,
    /// `Sec-WebSocket-Extensions` answer when a `permessage-deflate` offer was accepted.
    pub extensions: Option<String>,
}

impl WebSocketNegotiation {
    pub fn per_message_deflate(&self) -> bool {
        self.extensions.is_some()
    }
}

/// Validates the handshake headers. The error is the reason sent with the `400`.
pub fn negotiate(headers: &HeaderList) -> Result<WebSocketNegotiation, String> {
    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| "Missing Sec-WebSocket-Key".to_owned())?;

    let version = headers.get("sec-websocket-version").map(str::trim).unwrap_or("");
    if version != "8" && version != "13" {
        return Err(format!("Unsupported Sec-WebSocket-Version: {version}"));
    }

    let protocol = headers
        .get_all("sec-websocket-protocol")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_owned);

    Ok(WebSocketNegotiation {
        accept: derive_accept_key(key.as_bytes()),
        protocol,
        extensions: deflate::accept_offer(headers),
    })
}

/// Validates the origin's answer to an outbound handshake. `Ok(true)` when
/// the origin enabled `permessage-deflate`.
fn check_handshake(head: &[u8], key: &str, offered: &WebSocketNegotiation) -> Result<bool, String> {
    let mut headers = [httparse::EMPTY_HEADER; upstream::RESPONSE_MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(head)
        .map_err(|e| format!("malformed websocket handshake response: {e}"))?;
    match response.code {
        Some(101) => {}
        Some(status) => return Err(format!("origin answered the websocket handshake with {status}")),
        None => return Err("empty websocket handshake response".to_owned()),
    }
    let headers: HeaderList = response
        .headers
        .iter()
        .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    if !headers.has_token("upgrade", "websocket") {
        return Err("origin did not switch to websocket".to_owned());
    }
    if headers.get("sec-websocket-accept").map(str::trim) != Some(derive_accept_key(key.as_bytes()).as_str()) {
        return Err("origin sent a wrong Sec-WebSocket-Accept".to_owned());
    }
    let selected = headers.get("sec-websocket-protocol").map(str::trim);
    if selected != offered.protocol.as_deref() {
        return Err(format!(
            "origin selected subprotocol {:?}, client was granted {:?}",
            selected, offered.protocol
        ));
    }
    if !offered.per_message_deflate() {
        return match headers.get("sec-websocket-extensions") {
            Some(extensions) => Err(format!("origin enabled unrequested extensions {extensions}")),
            None => Ok(false),
        };
    }
    deflate::accepted_by_origin(&headers)
}

pub struct HttpUpgradeContext {
    meta: Arc<ContextMeta>,
    env: ContextEnv,
    request: RequestView,
    local: LocalResponse,
    handle_websocket: bool,
    upstream_proxy: Option<UpstreamProxy>,
    remote_response: Option<ResponseView>,
    negotiation: Option<WebSocketNegotiation>,
}

impl HttpUpgradeContext {
    pub fn new(meta: Arc<ContextMeta>, request: RequestView, local: LocalResponse, env: ContextEnv) -> Self {
        let handle_websocket = env.flags.handle_websocket;
        let upstream_proxy = env.upstream_proxy.clone();
        Self {
            meta,
            env,
            request,
            local,
            handle_websocket,
            upstream_proxy,
            remote_response: None,
            negotiation: None,
        }
    }

    pub fn meta(&self) -> &Arc<ContextMeta> {
        &self.meta
    }

    pub fn request(&self) -> &RequestView {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestView {
        &mut self.request
    }

    /// Lower-cased `Upgrade` value.
    pub fn protocol(&self) -> String {
        self.request.get("upgrade").trim().to_ascii_lowercase()
    }

    pub fn is_websocket(&self) -> bool {
        self.protocol() == "websocket"
    }

    pub fn set_handle_websocket(&mut self, handle: bool) {
        self.handle_websocket = handle;
    }

    pub fn set_upstream_proxy(&mut self, proxy: Option<UpstreamProxy>) {
        self.upstream_proxy = proxy;
    }

    /// The `101` (or mirrored non-101) answer once it has been produced.
    pub fn remote_response(&self) -> Option<&ResponseView> {
        self.remote_response.as_ref()
    }

    pub fn negotiation(&self) -> Option<&WebSocketNegotiation> {
        self.negotiation.as_ref()
    }

    pub async fn connect(&mut self) -> Result<(), ContextError> {
        if self.is_websocket() && self.handle_websocket {
            self.websocket().await
        } else {
            self.generic().await
        }
    }

    async fn websocket(&mut self) -> Result<(), ContextError> {
        let negotiation = match negotiate(self.request.headers()) {
            Ok(negotiation) => negotiation,
            Err(reason) => {
                self.reject(StatusCode::BAD_REQUEST, &reason)?;
                return Err(ContextError::ProtocolViolation(reason));
            }
        };

        let mut headers = HeaderList::new();
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append("Sec-WebSocket-Accept", negotiation.accept.clone());
        if let Some(protocol) = &negotiation.protocol {
            headers.append("Sec-WebSocket-Protocol", protocol.clone());
        }
        if let Some(extensions) = &negotiation.extensions {
            headers.append("Sec-WebSocket-Extensions", extensions.clone());
        }
        self.local.send_head(StatusCode::SWITCHING_PROTOCOLS, &headers)?;
        self.remote_response = Some(ResponseView::synthetic(
            StatusCode::SWITCHING_PROTOCOLS,
            headers,
            Body::Empty,
        ));
        self.negotiation = Some(negotiation.clone());

        let mut local_socket = self.local.upgrade().await?;
        if negotiation.per_message_deflate() {
            local_socket = Box::new(DeflateSocket::new(local_socket));
        }
        let mut local = WebSocketStream::from_raw_socket(local_socket, Role::Server, None).await;

        let remote = match self.open_remote(&negotiation).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = local
                    .close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "upstream unavailable".into(),
                    }))
                    .await;
                return Err(e);
            }
        };

        let session = WebSocketSessionContext::new(
            ContextMeta::child(ContextKind::WebSocketSession, &self.meta),
            local,
            remote,
        );
        self.env.process(ConnectionContext::WebSocketSession(session)).await
    }

    /// Performs the outbound handshake, offering what the client was granted.
    ///
    /// Only the client's first subprotocol is forwarded, and the origin has
    /// to select exactly that one: the client has already been told it was
    /// agreed, so a `101` naming another protocol (or none) fails the session.
    /// `permessage-deflate` is offered iff the client leg enabled it; the
    /// origin may still decline, in which case this leg stays uncompressed.
    async fn open_remote(&mut self, negotiation: &WebSocketNegotiation) -> Result<WsStream, ContextError> {
        let hostname = self.request.hostname();
        let port = self.request.port();
        let secure = self.request.secure();
        let mut path = self.request.path();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let key = generate_key();

        let mut head = String::with_capacity(512);
        let _ = write!(
            head,
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n",
            authority(&hostname, port)
        );
        if let Some(protocol) = &negotiation.protocol {
            let _ = write!(head, "Sec-WebSocket-Protocol: {protocol}\r\n");
        }
        if negotiation.per_message_deflate() {
            let _ = write!(head, "Sec-WebSocket-Extensions: {}\r\n", deflate::EXTENSION_NAME);
        }
        for (name, value) in self.request.headers().iter() {
            let lower = name.to_ascii_lowercase();
            if is_hop_by_hop(&lower) || lower == "host" || lower.starts_with("sec-websocket-") {
                continue;
            }
            if value.contains(['\r', '\n']) {
                continue;
            }
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");

        let Remote { socket, .. } =
            upstream::connect_tunnel(&hostname, port, self.upstream_proxy.as_ref(), &self.env.tls).await?;
        let mut socket = if secure {
            self.env.tls.connect(&hostname, socket).await?
        } else {
            socket
        };

        tracing::debug!(context_id = %self.meta.id(), host = %hostname, port, path = %path, "Opening outbound websocket");
        socket.write_all(head.as_bytes()).await.map_err(ContextError::remote)?;
        socket.flush().await.map_err(ContextError::remote)?;
        let response = upstream::read_response_head(&mut socket, "websocket handshake").await?;
        let compressed = check_handshake(&response, &key, negotiation)
            .map_err(|reason| ContextError::other(Side::Remote, reason))?;

        let socket: BoxSocket = if compressed {
            Box::new(DeflateSocket::new(socket))
        } else {
            socket
        };
        Ok(WebSocketStream::from_raw_socket(socket, Role::Client, None).await)
    }

    /// Minimal error answer that closes the client connection.
    fn reject(&mut self, status: StatusCode, reason: &str) -> Result<(), ContextError> {
        let body = Bytes::from(reason.to_owned());
        let length = body.len();
        let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed_unsync());
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(length));
        self.local.send(response)
    }

    async fn generic(&mut self) -> Result<(), ContextError> {
        let hostname = self.request.hostname();
        if hostname.is_empty() {
            let reason = "upgrade request has no host";
            self.reject(StatusCode::BAD_REQUEST, reason)?;
            return Err(ContextError::ProtocolViolation(reason.to_owned()));
        }
        let port = self.request.port();
        let secure = self.request.secure();

        let route =
            upstream::connect_origin(&hostname, port, secure, self.upstream_proxy.as_ref(), &self.env.tls).await?;
        let outbound = outbound_request(&mut self.request, route.absolute_form)?;
        let mut response = send(route.socket, outbound, true).await?;

        let status = response.status();
        let headers = HeaderList::from_header_map(response.headers());
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let (_, incoming) = response.into_parts();
            let view = self
                .remote_response
                .insert(ResponseView::remote(status, headers, Body::from_http(incoming)));
            return write_response(view, &mut self.local).await;
        }

        let remote_upgrade = hyper::upgrade::on(&mut response);
        self.local.send_head(status, &headers)?;
        self.remote_response = Some(ResponseView::remote(status, headers, Body::Empty));

        let remote = remote_upgrade
            .await
            .map_err(|e| ContextError::other(Side::Remote, e))?;
        let local = self.local.upgrade().await?;

        tracing::debug!(context_id = %self.meta.id(), protocol = %self.protocol(), "Protocol switched");
        let mut stream = StreamContext::with_remote(
            ContextMeta::child(ContextKind::Stream, &self.meta),
            local,
            Remote {
                socket: Box::new(TokioIo::new(remote)),
                peer: None,
            },
            Bytes::new(),
        );
        stream.set_local_timeout(None);
        stream.set_remote_timeout(None);
        self.env.process(ConnectionContext::Stream(stream)).await
    }
}

impl fmt::Debug for HttpUpgradeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpgradeContext")
            .field("meta", &self.meta)
            .field("request", &self.request)
            .field("handle_websocket", &self.handle_websocket)
            .field("remote_response", &self.remote_response)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use hyper::{Method, Version};

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().copied().collect()
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        let negotiation = negotiate(&headers(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "13"),
        ]))
        .unwrap();
        assert_eq!(negotiation.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(negotiation.protocol, None);
    }

    #[test]
    fn first_subprotocol_and_deflate_are_recorded() {
        let negotiation = negotiate(&headers(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "8"),
            ("Sec-WebSocket-Protocol", "chat, superchat"),
            ("Sec-WebSocket-Extensions", "permessage-deflate; client_max_window_bits"),
        ]))
        .unwrap();
        assert_eq!(negotiation.protocol.as_deref(), Some("chat"));
        assert_eq!(
            negotiation.extensions.as_deref(),
            Some("permessage-deflate; server_no_context_takeover")
        );
    }

    fn granted(protocol: Option<&str>, deflate: bool) -> WebSocketNegotiation {
        WebSocketNegotiation {
            accept: String::new(),
            protocol: protocol.map(str::to_owned),
            extensions: deflate.then(|| "permessage-deflate".to_owned()),
        }
    }

    fn switching(extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n{extra}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn origin_handshake_must_match_what_the_client_was_granted() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(check_handshake(&switching(""), key, &granted(None, false)), Ok(false));
        assert_eq!(
            check_handshake(&switching("Sec-WebSocket-Protocol: chat\r\n"), key, &granted(Some("chat"), false)),
            Ok(false)
        );
        // Subprotocol dropped or swapped by the origin.
        assert!(check_handshake(&switching(""), key, &granted(Some("chat"), false)).is_err());
        assert!(check_handshake(
            &switching("Sec-WebSocket-Protocol: superchat\r\n"),
            key,
            &granted(Some("chat"), false)
        )
        .is_err());
        assert!(check_handshake(&switching(""), "AQIDBAUGBwgJCgsMDQ4PEC==", &granted(None, false)).is_err());
    }

    #[test]
    fn origin_may_decline_deflate_but_not_force_it() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let deflate = "Sec-WebSocket-Extensions: permessage-deflate\r\n";
        assert_eq!(check_handshake(&switching(deflate), key, &granted(None, true)), Ok(true));
        assert_eq!(check_handshake(&switching(""), key, &granted(None, true)), Ok(false));
        assert!(check_handshake(&switching(deflate), key, &granted(None, false)).is_err());
        assert!(check_handshake(b"HTTP/1.1 403 Forbidden\r\n\r\n", key, &granted(None, true)).is_err());
    }

    #[test]
    fn rejects_missing_key_and_bad_version() {
        assert!(negotiate(&headers(&[("Sec-WebSocket-Version", "13")])).is_err());
        assert!(negotiate(&headers(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Version", "7"),
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn bad_version_answers_400_and_fails() {
        let request = RequestView::new(
            Method::GET,
            "/chat",
            Version::HTTP_11,
            headers(&[
                ("Host", "127.0.0.1:9"),
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
                ("Sec-WebSocket-Version", "7"),
            ]),
        );
        let (local, pending) = LocalResponse::channel();
        let meta = ContextMeta::new(ContextKind::HttpUpgrade, testing::client(), None);
        let mut ctx = HttpUpgradeContext::new(meta, request, local, testing::env());
        assert!(ctx.is_websocket());

        let err = ctx.connect().await.unwrap_err();
        assert!(matches!(err, ContextError::ProtocolViolation(_)));

        let response = pending.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["connection"], "close");
        let length: usize = response.headers()["content-length"].to_str().unwrap().parse().unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), length);
    }
}
