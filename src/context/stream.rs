//! Raw bidirectional byte relay.
//!
//! # Data Flow
//! ```text
//! remote factory → socket → write head bytes
//! local  ──read──▶ outgoing taps ──write──▶ remote
//! local ◀──write── incoming taps ◀──read─── remote
//! ```
//!
//! # Design Decisions
//! - Each socket has its own inactivity clock, touched by reads and writes
//! - A side going idle only half-closes its peer; the other direction keeps flowing
//! - The first error drops both directions and is returned

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::context::{ContextError, ContextMeta, Side};
use crate::http::message::{BodySink, SinkSet};
use crate::net::socket::BoxSocket;
use crate::net::upstream::Remote;

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

type RemoteFactory = Box<dyn FnOnce() -> BoxFuture<'static, Result<Remote, ContextError>> + Send>;

pub struct StreamContext {
    meta: Arc<ContextMeta>,
    local: Option<BoxSocket>,
    remote: Option<RemoteFactory>,
    remote_addr: Option<SocketAddr>,
    head: Bytes,
    local_timeout: Option<Duration>,
    remote_timeout: Option<Duration>,
    incoming_taps: SinkSet,
    outgoing_taps: SinkSet,
}

impl StreamContext {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// `remote` is invoked once, when `connect()` runs.
    pub fn new<F, Fut>(meta: Arc<ContextMeta>, local: BoxSocket, remote: F, head: Bytes) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Remote, ContextError>> + Send + 'static,
    {
        Self {
            meta,
            local: Some(local),
            remote: Some(Box::new(
                move || -> BoxFuture<'static, Result<Remote, ContextError>> { Box::pin(remote()) },
            )),
            remote_addr: None,
            head,
            local_timeout: Some(Self::DEFAULT_TIMEOUT),
            remote_timeout: Some(Self::DEFAULT_TIMEOUT),
            incoming_taps: SinkSet::new(),
            outgoing_taps: SinkSet::new(),
        }
    }

    /// Relay towards an already opened remote.
    pub fn with_remote(meta: Arc<ContextMeta>, local: BoxSocket, remote: Remote, head: Bytes) -> Self {
        let remote_addr = remote.peer;
        let mut context = Self::new(meta, local, move || async move { Ok(remote) }, head);
        context.remote_addr = remote_addr;
        context
    }

    pub fn meta(&self) -> &Arc<ContextMeta> {
        &self.meta
    }

    /// Bytes written to the remote before relaying starts.
    pub fn head(&self) -> &Bytes {
        &self.head
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_timeout(&self) -> Option<Duration> {
        self.local_timeout
    }

    pub fn set_local_timeout(&mut self, timeout: Option<Duration>) {
        self.local_timeout = timeout;
    }

    pub fn remote_timeout(&self) -> Option<Duration> {
        self.remote_timeout
    }

    pub fn set_remote_timeout(&mut self, timeout: Option<Duration>) {
        self.remote_timeout = timeout;
    }

    /// Copies every remote → local chunk into `sink`.
    pub fn save_incoming(&mut self, sink: BodySink) {
        self.incoming_taps.push(sink);
    }

    /// Copies every local → remote chunk into `sink`.
    pub fn save_outgoing(&mut self, sink: BodySink) {
        self.outgoing_taps.push(sink);
    }

    pub async fn connect(&mut self) -> Result<(), ContextError> {
        let (local, factory) = match (self.local.take(), self.remote.take()) {
            (Some(local), Some(factory)) => (local, factory),
            _ => {
                return Err(ContextError::ProtocolViolation(
                    "stream context already connected".to_owned(),
                ))
            }
        };

        let Remote { mut socket, peer } = factory().await?;
        if peer.is_some() {
            self.remote_addr = peer;
        }
        if !self.head.is_empty() {
            socket.write_all(&self.head).await.map_err(ContextError::remote)?;
        }

        let local_clock = IdleClock::new();
        let remote_clock = IdleClock::new();
        let (local_rd, local_wr) = tokio::io::split(local);
        let (remote_rd, remote_wr) = tokio::io::split(socket);

        let outgoing = pump(
            Leg {
                from: Side::Local,
                reader: local_rd,
                reader_clock: &local_clock,
                idle: self.local_timeout,
                writer: remote_wr,
                writer_clock: &remote_clock,
            },
            &mut self.outgoing_taps,
        );
        let incoming = pump(
            Leg {
                from: Side::Remote,
                reader: remote_rd,
                reader_clock: &remote_clock,
                idle: self.remote_timeout,
                writer: local_wr,
                writer_clock: &local_clock,
            },
            &mut self.incoming_taps,
        );

        let (sent, received) = tokio::try_join!(outgoing, incoming)?;
        tracing::debug!(
            context_id = %self.meta.id(),
            remote = ?self.remote_addr,
            bytes_sent = sent,
            bytes_received = received,
            "Stream closed"
        );
        Ok(())
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("meta", &self.meta)
            .field("head_len", &self.head.len())
            .field("local_timeout", &self.local_timeout)
            .field("remote_timeout", &self.remote_timeout)
            .finish_non_exhaustive()
    }
}

/// Last activity on one socket, shared by both directions touching it.
struct IdleClock {
    origin: Instant,
    last_millis: AtomicU64,
}

impl IdleClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

struct Leg<'a, R, W> {
    from: Side,
    reader: R,
    reader_clock: &'a IdleClock,
    idle: Option<Duration>,
    writer: W,
    writer_clock: &'a IdleClock,
}

/// Copies one direction until EOF or inactivity, then half-closes the writer.
async fn pump<R, W>(leg: Leg<'_, R, W>, taps: &mut SinkSet) -> Result<u64, ContextError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Leg {
        from,
        mut reader,
        reader_clock,
        idle,
        mut writer,
        writer_clock,
    } = leg;
    let to = match from {
        Side::Local => Side::Remote,
        Side::Remote => Side::Local,
    };
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match idle {
            None => Some(reader.read(&mut buf).await),
            Some(limit) => {
                let remaining = limit.saturating_sub(reader_clock.idle_for());
                if remaining.is_zero() {
                    None
                } else {
                    match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
                        Ok(read) => Some(read),
                        // Activity in the other direction resets the clock.
                        Err(_) => continue,
                    }
                }
            }
        };

        let n = match read {
            Some(read) => read.map_err(|e| ContextError::transport(from, e))?,
            None => {
                tracing::debug!(side = %from, "Socket idle, ending peer");
                0
            }
        };
        if n == 0 {
            if let Err(e) = writer.shutdown().await {
                tracing::trace!(side = %to, error = %e, "Peer already closed");
            }
            taps.finish();
            return Ok(total);
        }

        reader_clock.touch();
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| ContextError::transport(to, e))?;
        writer_clock.touch();
        taps.write(&buf[..n]);
        total += n as u64;
    }
}
