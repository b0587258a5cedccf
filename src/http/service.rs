//! HTTP/1.1 serving of client connections.
//!
//! Every request on the connection becomes an `HttpContext` or an
//! `HttpUpgradeContext`; the hyper service waits for the context to produce
//! the response head.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::context::{
    ConnectionContext, ContextEnv, ContextError, ContextKind, ContextMeta, HttpContext, HttpUpgradeContext, Side,
};
use crate::http::local::LocalResponse;
use crate::http::message::{Body, RequestView};
use crate::http::ProxyBody;
use crate::net::socket::BoxSocket;
use crate::security::{AuthPhase, Authenticator};

/// How requests read from one connection are turned into contexts.
#[derive(Clone)]
pub struct ServeOptions {
    pub env: ContextEnv,
    pub client_addr: SocketAddr,
    /// The connection was TLS-terminated by the proxy.
    pub encrypted: bool,
    /// The CONNECT context this connection was bridged from.
    pub parent: Option<Arc<ContextMeta>>,
    /// Requests carrying `Upgrade` become upgrade contexts.
    pub upgrades: bool,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

/// Serves `socket` until the client closes it.
pub async fn serve_connection(socket: BoxSocket, options: ServeOptions) -> Result<(), ContextError> {
    let options = Arc::new(options);
    let service = service_fn(move |request: Request<Incoming>| {
        let options = Arc::clone(&options);
        async move { Ok::<_, Infallible>(dispatch(request, &options).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(socket), service)
        .with_upgrades()
        .await
        .map_err(|e| ContextError::other(Side::Local, e))
}

async fn dispatch(mut request: Request<Incoming>, options: &ServeOptions) -> Response<ProxyBody> {
    if request.method() == Method::CONNECT {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT is only accepted as the first request");
    }

    let on_upgrade = hyper::upgrade::on(&mut request);
    let (parts, body) = request.into_parts();
    let view = RequestView::from_parts(parts, Body::from_http(body), options.encrypted);
    let upgrade = options.upgrades && view.headers().contains("upgrade");

    if let Some(authenticator) = &options.authenticator {
        let phase = if upgrade { AuthPhase::Upgrade } else { AuthPhase::Request };
        if !authenticator.authenticate(&view, phase) {
            tracing::info!(client = %options.client_addr, target = %view.target(), "Proxy authentication failed");
            return proxy_auth_required();
        }
    }

    let (local, pending) = LocalResponse::channel();
    let env = options.env.clone();
    let context = if upgrade {
        let meta = ContextMeta::new(ContextKind::HttpUpgrade, options.client_addr, options.parent.as_ref());
        ConnectionContext::HttpUpgrade(HttpUpgradeContext::new(meta, view, local.with_upgrade(on_upgrade), env))
    } else {
        let meta = ContextMeta::new(ContextKind::Http, options.client_addr, options.parent.as_ref());
        ConnectionContext::Http(HttpContext::new(meta, view, local, env))
    };
    let id = context.meta().id();
    options.env.spawn(context);

    match pending.recv().await {
        Some(response) => response,
        None => {
            tracing::debug!(context_id = %id, "Context finished without a response");
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

/// Small `text/plain` response produced by the proxy itself.
pub(crate) fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(message.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));
    response
}

pub(crate) const PROXY_AUTHENTICATE_VALUE: &str = "Basic realm=\"proxy\"";

fn proxy_auth_required() -> Response<ProxyBody> {
    let mut response = error_response(
        StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        "Proxy Authentication Required",
    );
    response
        .headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(PROXY_AUTHENTICATE_VALUE));
    response
}
