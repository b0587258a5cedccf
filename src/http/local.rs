//! The client-facing half of an HTTP exchange.
//!
//! hyper owns the local connection; a context talks to it through a oneshot
//! carrying the response head and a channel feeding the response body.

use std::fmt;
use std::io;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::upgrade::OnUpgrade;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, oneshot};

use crate::context::ContextError;
use crate::http::headers::HeaderList;
use crate::http::ProxyBody;
use crate::net::socket::BoxSocket;

const BODY_CHANNEL_DEPTH: usize = 16;

/// Where a context writes the response for the client.
pub struct LocalResponse {
    responder: Option<oneshot::Sender<Response<ProxyBody>>>,
    on_upgrade: Option<OnUpgrade>,
}

/// The dispatcher's end: resolves once the context produced a response head.
pub struct PendingResponse(oneshot::Receiver<Response<ProxyBody>>);

impl PendingResponse {
    /// `None` when the context finished without answering.
    pub async fn recv(self) -> Option<Response<ProxyBody>> {
        self.0.await.ok()
    }
}

impl LocalResponse {
    pub fn channel() -> (LocalResponse, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (
            LocalResponse {
                responder: Some(tx),
                on_upgrade: None,
            },
            PendingResponse(rx),
        )
    }

    pub fn with_upgrade(mut self, on_upgrade: OnUpgrade) -> Self {
        self.on_upgrade = Some(on_upgrade);
        self
    }

    pub fn is_sent(&self) -> bool {
        self.responder.is_none()
    }

    pub fn send(&mut self, response: Response<ProxyBody>) -> Result<(), ContextError> {
        let responder = self.responder.take().ok_or_else(|| {
            ContextError::local(io::Error::other("local response already written"))
        })?;
        responder.send(response).map_err(|_| {
            ContextError::local(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client connection closed",
            ))
        })
    }

    /// Sends a head whose body is produced through the returned writer.
    pub fn write_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderList,
    ) -> Result<BodyWriter, ContextError> {
        let (tx, rx) = mpsc::channel::<io::Result<Frame<Bytes>>>(BODY_CHANNEL_DEPTH);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers.to_header_map();
        self.send(response)?;
        Ok(BodyWriter { tx })
    }

    /// Sends a head with no body.
    pub fn send_head(&mut self, status: StatusCode, headers: &HeaderList) -> Result<(), ContextError> {
        let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers.to_header_map();
        self.send(response)
    }

    /// Waits for hyper to hand over the client socket after a `101`.
    pub async fn upgrade(&mut self) -> Result<BoxSocket, ContextError> {
        let on_upgrade = self.on_upgrade.take().ok_or_else(|| {
            ContextError::ProtocolViolation("connection cannot be upgraded".to_owned())
        })?;
        let upgraded = on_upgrade
            .await
            .map_err(|e| ContextError::other(crate::context::Side::Local, e))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

impl fmt::Debug for LocalResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalResponse")
            .field("sent", &self.is_sent())
            .field("upgradable", &self.on_upgrade.is_some())
            .finish()
    }
}

/// Feeds the body of a response sent with [`LocalResponse::write_head`].
/// Dropping it ends the body.
#[derive(Debug, Clone)]
pub struct BodyWriter {
    tx: mpsc::Sender<io::Result<Frame<Bytes>>>,
}

impl BodyWriter {
    pub async fn write(&self, chunk: Bytes) -> Result<(), ContextError> {
        self.tx.send(Ok(Frame::data(chunk))).await.map_err(|_| {
            ContextError::local(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client stopped reading the response",
            ))
        })
    }

    /// Ends the body with an error so the client sees a truncated response.
    pub async fn abort(self, error: io::Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}
