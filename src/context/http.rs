//! Plain HTTP request/response forwarding.
//!
//! # Data Flow
//! ```text
//! RequestView → strip hop-by-hop → net::upstream (direct | proxy | tunnel+TLS)
//!     → hyper client conn → ResponseView
//!     → local head, then body chunks: passive sinks first, client last
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use hyper::client::conn::http1;
use hyper::{Request, StatusCode, Version};
use hyper_util::rt::TokioIo;

use crate::context::{ContextEnv, ContextError, ContextMeta, Side};
use crate::http::headers::HeaderList;
use crate::http::local::LocalResponse;
use crate::http::message::{authority, Body, RequestView, ResponseView};
use crate::http::ProxyBody;
use crate::net::socket::BoxSocket;
use crate::net::upstream::{self, UpstreamProxy};

pub struct HttpContext {
    meta: Arc<ContextMeta>,
    env: ContextEnv,
    request: RequestView,
    local: LocalResponse,
    remote_response: Option<ResponseView>,
    strip_hop_by_hop: bool,
    upstream_proxy: Option<UpstreamProxy>,
}

impl HttpContext {
    pub fn new(meta: Arc<ContextMeta>, request: RequestView, local: LocalResponse, env: ContextEnv) -> Self {
        let upstream_proxy = env.upstream_proxy.clone();
        Self {
            meta,
            env,
            request,
            local,
            remote_response: None,
            strip_hop_by_hop: true,
            upstream_proxy,
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

    pub fn remote_response(&self) -> Option<&ResponseView> {
        self.remote_response.as_ref()
    }

    pub fn remote_response_mut(&mut self) -> Option<&mut ResponseView> {
        self.remote_response.as_mut()
    }

    pub fn set_strip_hop_by_hop(&mut self, strip: bool) {
        self.strip_hop_by_hop = strip;
    }

    pub fn upstream_proxy(&self) -> Option<&UpstreamProxy> {
        self.upstream_proxy.as_ref()
    }

    pub fn set_upstream_proxy(&mut self, proxy: Option<UpstreamProxy>) {
        self.upstream_proxy = proxy;
    }

    /// Answers locally without contacting the origin.
    pub fn fake_response(&mut self, status: StatusCode, headers: HeaderList, body: impl Into<Body>) {
        self.remote_response = Some(ResponseView::synthetic(status, headers, body));
    }

    /// Sends the request to its origin and stores the response head and body.
    pub async fn make_remote_request(&mut self) -> Result<&mut ResponseView, ContextError> {
        if self.strip_hop_by_hop {
            self.request.delete_hop_by_hop_headers();
        }
        let hostname = self.request.hostname();
        if hostname.is_empty() {
            return Err(ContextError::ProtocolViolation("request has no host".to_owned()));
        }
        let port = self.request.port();
        let secure = self.request.secure();

        tracing::debug!(
            context_id = %self.meta.id(),
            method = %self.request.method(),
            target = %self.request.href(),
            via = ?self.upstream_proxy.as_ref().map(UpstreamProxy::authority),
            "Forwarding request"
        );

        let route = upstream::connect_origin(&hostname, port, secure, self.upstream_proxy.as_ref(), &self.env.tls).await?;
        let outbound = outbound_request(&mut self.request, route.absolute_form)?;
        let response = send(route.socket, outbound, false).await?;

        let (parts, incoming) = response.into_parts();
        let view = ResponseView::remote(
            parts.status,
            HeaderList::from_header_map(&parts.headers),
            Body::from_http(incoming),
        );
        Ok(self.remote_response.insert(view))
    }

    /// Writes the stored response to the client, head first.
    pub async fn write_local_response(&mut self) -> Result<(), ContextError> {
        let response = self.remote_response.as_mut().ok_or_else(|| {
            ContextError::ProtocolViolation("no response to write".to_owned())
        })?;
        write_response(response, &mut self.local).await
    }

    pub async fn connect(&mut self) -> Result<(), ContextError> {
        if self.remote_response.is_none() {
            self.make_remote_request().await?;
        }
        self.write_local_response().await
    }
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("meta", &self.meta)
            .field("request", &self.request)
            .field("remote_response", &self.remote_response)
            .field("strip_hop_by_hop", &self.strip_hop_by_hop)
            .finish_non_exhaustive()
    }
}

/// Builds the outbound hyper request mirroring `request`. Request sinks see the
/// body as it is sent.
pub(crate) fn outbound_request(request: &mut RequestView, absolute_form: bool) -> Result<Request<ProxyBody>, ContextError> {
    let uri = if absolute_form {
        format!(
            "{}://{}{}",
            request.protocol(),
            authority(&request.hostname(), request.port()),
            request.path()
        )
    } else {
        request.path()
    };
    let uri: hyper::Uri = uri
        .parse()
        .map_err(|e| ContextError::ProtocolViolation(format!("invalid request target: {e}")))?;

    let mut headers = request.headers().clone();
    if !headers.contains("host") {
        headers.insert("Host", request.host());
    }
    let sinks = request.take_sinks();
    let body = request.take_body().tee(sinks).into_http_body();

    let mut outbound = Request::new(body);
    *outbound.method_mut() = request.method().clone();
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers.to_header_map();
    Ok(outbound)
}

/// Sends one request over a fresh HTTP/1.1 client connection.
pub(crate) async fn send(
    socket: BoxSocket,
    request: Request<ProxyBody>,
    upgrades: bool,
) -> Result<hyper::Response<hyper::body::Incoming>, ContextError> {
    let (mut sender, conn) = http1::handshake(TokioIo::new(socket))
        .await
        .map_err(|e| ContextError::other(Side::Remote, e))?;
    tokio::spawn(async move {
        let result = if upgrades {
            conn.with_upgrades().await
        } else {
            conn.await
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Outbound connection ended with error");
        }
    });
    sender
        .send_request(request)
        .await
        .map_err(|e| ContextError::other(Side::Remote, e))
}

/// Mirrors a response to the client: head unmodified, body copied to passive
/// sinks before each chunk reaches the client.
pub(crate) async fn write_response(response: &mut ResponseView, local: &mut LocalResponse) -> Result<(), ContextError> {
    let body = response.take_body();
    let known_length = match &body {
        Body::Empty => Some(0),
        Body::Bytes(bytes) => Some(bytes.len()),
        Body::Text(text) => Some(text.len()),
        Body::Stream(_) => None,
    };
    if let (true, Some(length)) = (response.is_synthetic(), known_length) {
        let headers = response.headers_mut();
        if !headers.contains("content-length") && !headers.contains("transfer-encoding") {
            headers.insert("Content-Length", length.to_string());
        }
    }
    let writer = local.write_head(response.status(), response.headers())?;
    let mut sinks = response.take_sinks();

    match body {
        Body::Empty => {}
        Body::Bytes(bytes) => {
            sinks.write(&bytes);
            writer.write(bytes).await?;
        }
        Body::Text(text) => {
            let bytes = Bytes::from(text);
            sinks.write(&bytes);
            writer.write(bytes).await?;
        }
        Body::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let kind = e.kind();
                        writer.abort(std::io::Error::new(kind, "remote body failed")).await;
                        return Err(ContextError::remote(e));
                    }
                };
                sinks.write(&chunk);
                writer.write(chunk).await?;
            }
        }
    }
    sinks.finish();
    Ok(())
}
