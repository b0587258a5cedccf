//! WebSocket frame relay with per-direction transform pipelines.
//!
//! # Data Flow
//! ```text
//! remote ──frame──▶ incoming steps… ▶ deliver ──▶ local
//! local  ──frame──▶ outgoing steps… ▶ deliver ──▶ remote
//! ```
//!
//! A step receives the frame and a [`Next`]. Running `next` moves on to the
//! following step; returning without running it drops the frame. The deliver
//! step is always last and forwards whatever frame reaches it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::context::{ContextError, ContextMeta, FrameError, Side};
use crate::net::socket::BoxSocket;
use crate::observability::metrics;

pub type WsStream = WebSocketStream<BoxSocket>;

/// Close code recorded when a close frame carried none.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code recorded when the transport ended without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    pub binary: bool,
    /// Set on frames that arrived from a client (they are masked on the wire).
    pub masked: bool,
}

/// A data frame travelling through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub flags: FrameFlags,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            flags: FrameFlags::default(),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: FrameFlags {
                binary: true,
                masked: false,
            },
        }
    }

    fn into_message(self) -> Result<Message, FrameError> {
        if self.flags.binary {
            return Ok(Message::binary(self.data));
        }
        let text = String::from_utf8(self.data.to_vec()).map_err(|_| FrameError::InvalidText)?;
        Ok(Message::text(text))
    }
}

pub trait FrameTransform: Send + Sync + 'static {
    fn transform<'a>(&'a self, frame: &'a mut Frame, next: Next<'a>) -> BoxFuture<'a, Result<(), FrameError>>;
}

/// Continuation into the rest of a pipeline.
pub struct Next<'a> {
    steps: &'a [Arc<dyn FrameTransform>],
    delivered: &'a mut Option<Frame>,
}

impl<'a> Next<'a> {
    pub fn run(self, frame: &'a mut Frame) -> BoxFuture<'a, Result<(), FrameError>> {
        match self.steps.split_first() {
            Some((step, rest)) => step.transform(
                frame,
                Next {
                    steps: rest,
                    delivered: self.delivered,
                },
            ),
            None => {
                *self.delivered = Some(frame.clone());
                Box::pin(futures_util::future::ready(Ok(())))
            }
        }
    }
}

/// Runs `frame` through `steps`, returning what reached the deliver step.
async fn run_pipeline(steps: &[Arc<dyn FrameTransform>], mut frame: Frame) -> Result<Option<Frame>, FrameError> {
    let mut delivered = None;
    Next {
        steps,
        delivered: &mut delivered,
    }
    .run(&mut frame)
    .await?;
    Ok(delivered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    fn source(&self) -> Side {
        match self {
            Direction::Incoming => Side::Remote,
            Direction::Outgoing => Side::Local,
        }
    }
}

pub struct WebSocketSessionContext {
    meta: Arc<ContextMeta>,
    local: Option<WsStream>,
    remote: Option<WsStream>,
    incoming: Vec<Arc<dyn FrameTransform>>,
    outgoing: Vec<Arc<dyn FrameTransform>>,
    local_close: Option<u16>,
    remote_close: Option<u16>,
}

impl WebSocketSessionContext {
    pub fn new(meta: Arc<ContextMeta>, local: WsStream, remote: WsStream) -> Self {
        Self {
            meta,
            local: Some(local),
            remote: Some(remote),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            local_close: None,
            remote_close: None,
        }
    }

    pub fn meta(&self) -> &Arc<ContextMeta> {
        &self.meta
    }

    /// Adds a step to the remote → local pipeline, after the ones already added.
    pub fn incoming(&mut self, step: impl FrameTransform) -> &mut Self {
        self.incoming.push(Arc::new(step));
        self
    }

    /// Adds a step to the local → remote pipeline, after the ones already added.
    pub fn outgoing(&mut self, step: impl FrameTransform) -> &mut Self {
        self.outgoing.push(Arc::new(step));
        self
    }

    pub fn local_close_code(&self) -> Option<u16> {
        self.local_close
    }

    pub fn remote_close_code(&self) -> Option<u16> {
        self.remote_close
    }

    pub async fn connect(&mut self) -> Result<(), ContextError> {
        let (local, remote) = match (self.local.take(), self.remote.take()) {
            (Some(local), Some(remote)) => (local, remote),
            _ => {
                return Err(ContextError::ProtocolViolation(
                    "websocket session already connected".to_owned(),
                ))
            }
        };
        let (local_tx, local_rx) = local.split();
        let (remote_tx, remote_rx) = remote.split();

        let (incoming, outgoing) = tokio::join!(
            relay(remote_rx, local_tx, &self.incoming, Direction::Incoming),
            relay(local_rx, remote_tx, &self.outgoing, Direction::Outgoing),
        );

        tracing::debug!(
            context_id = %self.meta.id(),
            remote_close = ?incoming.as_ref().ok(),
            local_close = ?outgoing.as_ref().ok(),
            "WebSocket session closed"
        );
        self.remote_close = incoming.as_ref().ok().copied();
        self.local_close = outgoing.as_ref().ok().copied();
        incoming?;
        outgoing?;
        Ok(())
    }
}

impl fmt::Debug for WebSocketSessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSessionContext")
            .field("meta", &self.meta)
            .field("incoming_steps", &self.incoming.len())
            .field("outgoing_steps", &self.outgoing.len())
            .field("local_close", &self.local_close)
            .field("remote_close", &self.remote_close)
            .finish()
    }
}

/// Forwards one direction until its source is closed. Returns the source's
/// close code.
async fn relay<S, K>(
    mut source: S,
    mut sink: K,
    steps: &[Arc<dyn FrameTransform>],
    direction: Direction,
) -> Result<u16, ContextError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut close_code = None;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
            Err(e) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "peer failed".into(),
                    })))
                    .await;
                let _ = sink.close().await;
                return Err(ContextError::other(direction.source(), e));
            }
        };

        let frame = match message {
            Message::Close(frame) => {
                let code = frame.as_ref().map_or(CLOSE_NO_STATUS, |f| u16::from(f.code));
                close_code.get_or_insert(code);
                if let Err(e) = sink.send(Message::Close(frame)).await {
                    tracing::trace!(direction = direction.as_str(), error = %e, "Close not forwarded");
                }
                continue;
            }
            Message::Text(text) => Frame {
                data: Bytes::from(text.as_str().to_owned()),
                flags: FrameFlags {
                    binary: false,
                    masked: direction == Direction::Outgoing,
                },
            },
            Message::Binary(data) => Frame {
                data,
                flags: FrameFlags {
                    binary: true,
                    masked: direction == Direction::Outgoing,
                },
            },
            // Control frames are answered per hop by the codec.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        metrics::record_websocket_frame(direction.as_str());
        let delivered = match run_pipeline(steps, frame).await.and_then(|f| f.map(Frame::into_message).transpose()) {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::debug!(direction = direction.as_str(), error = %e, "Frame transform failed, frame dropped");
                continue;
            }
        };
        if let Some(message) = delivered {
            if let Err(e) = sink.send(message).await {
                tracing::debug!(direction = direction.as_str(), error = %e, "Frame not delivered");
            }
        }
    }

    if close_code.is_none() {
        let _ = sink.close().await;
    }
    Ok(close_code.unwrap_or(CLOSE_ABNORMAL))
}
