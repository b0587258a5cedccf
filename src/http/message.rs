//! Request and response views.
//!
//! # Responsibilities
//! - Normalize an inbound request into a value a processor can inspect and edit
//! - Carry a remote or synthetic response until it is written locally
//! - Hold passive body sinks that receive a copy of every body chunk
//!
//! # Design Decisions
//! - A body is at most one of {empty, bytes, text, stream}
//! - Views own their data; contexts own their views

use std::fmt;
use std::io;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body as HttpBody, Frame};
use hyper::{Method, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::http::headers::HeaderList;
use crate::http::ProxyBody;

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Body source of a view.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Stream(BodyStream),
}

impl Body {
    /// Adapts any hyper body into a chunk stream. Trailers are dropped.
    pub fn from_http<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if body.is_end_stream() {
            return Body::Empty;
        }
        let stream = futures_util::stream::unfold(body, |mut body| async move {
            loop {
                match body.frame().await? {
                    Ok(frame) => {
                        if let Ok(data) = frame.into_data() {
                            return Some((Ok(data), body));
                        }
                    }
                    Err(e) => return Some((Err(io::Error::other(e)), body)),
                }
            }
        });
        Body::Stream(stream.boxed())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Text(t) => t.is_empty(),
            Body::Stream(_) => false,
        }
    }

    /// Reads the whole body into memory.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(b) => Ok(b),
            Body::Text(t) => Ok(Bytes::from(t)),
            Body::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }

    pub fn into_http_body(self) -> ProxyBody {
        match self {
            Body::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            Body::Bytes(b) => Full::new(b).map_err(|never| match never {}).boxed_unsync(),
            Body::Text(t) => Full::new(Bytes::from(t))
                .map_err(|never| match never {})
                .boxed_unsync(),
            Body::Stream(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        }
    }

    /// Returns a body that copies every chunk into `sinks` as it is consumed.
    pub fn tee(self, mut sinks: SinkSet) -> Self {
        if sinks.is_empty() {
            return self;
        }
        let stream = match self {
            Body::Stream(stream) => stream,
            other => futures_util::stream::once(async move { other.collect().await }).boxed(),
        };
        let tapped = futures_util::stream::unfold(
            (stream, Some(sinks.take())),
            |(mut stream, mut sinks)| async move {
                let set = sinks.as_mut()?;
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        set.write(&chunk);
                        Some((Ok(chunk), (stream, sinks)))
                    }
                    Some(Err(e)) => Some((Err(e), (stream, None))),
                    None => {
                        set.finish();
                        None
                    }
                }
            },
        );
        Body::Stream(tapped.boxed())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::Text(value.to_owned())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Bytes(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(value))
    }
}

/// Chunks a sink may fall behind by before it is dropped.
const SINK_BACKLOG: usize = 64;

type SinkTarget = Box<dyn AsyncWrite + Send + Unpin>;

/// A passive destination for body chunks.
///
/// The target is written from its own task. A sink that cannot keep up
/// loses the rest of the body instead of slowing the exchange down.
pub struct BodySink {
    target: Option<SinkTarget>,
    queue: Option<mpsc::Sender<Bytes>>,
    end: bool,
}

impl BodySink {
    /// `end` shuts the target down once the body is complete.
    pub fn new(target: impl AsyncWrite + Send + Unpin + 'static, end: bool) -> Self {
        Self {
            target: Some(Box::new(target)),
            queue: None,
            end,
        }
    }

    /// Spawns the writer on first use.
    fn queue(&mut self) -> Option<&mpsc::Sender<Bytes>> {
        if let Some(target) = self.target.take() {
            let (tx, rx) = mpsc::channel(SINK_BACKLOG);
            tokio::spawn(drain_sink(target, rx, self.end));
            self.queue = Some(tx);
        }
        self.queue.as_ref()
    }
}

async fn drain_sink(mut target: SinkTarget, mut chunks: mpsc::Receiver<Bytes>, end: bool) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(e) = target.write_all(&chunk).await {
            tracing::warn!(error = %e, "Body sink failed");
            return;
        }
    }
    let result = if end {
        target.shutdown().await
    } else {
        target.flush().await
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Body sink did not close cleanly");
    }
}

impl fmt::Debug for BodySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySink")
            .field("end", &self.end)
            .field("started", &self.queue.is_some())
            .finish()
    }
}

/// Ordered set of passive sinks. A sink that fails or falls behind is dropped.
#[derive(Debug, Default)]
pub struct SinkSet {
    sinks: Vec<BodySink>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: BodySink) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn take(&mut self) -> SinkSet {
        std::mem::take(self)
    }

    /// Queues a copy of `chunk` for every sink. Never waits on a sink.
    pub fn write(&mut self, chunk: &[u8]) {
        if self.sinks.is_empty() {
            return;
        }
        let chunk = Bytes::copy_from_slice(chunk);
        self.sinks.retain_mut(|sink| {
            let Some(queue) = sink.queue() else {
                return false;
            };
            match queue.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(backlog = SINK_BACKLOG, "Dropping body sink that fell behind");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!("Dropping failed body sink");
                    false
                }
            }
        });
    }

    /// Hands the end of the body to every sink; those registered with
    /// `end = true` shut their target down after the queued chunks.
    pub fn finish(&mut self) {
        for sink in self.sinks.iter_mut() {
            sink.queue();
        }
        self.sinks.clear();
    }
}

/// Normalized inbound request.
#[derive(Debug)]
pub struct RequestView {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderList,
    encrypted: bool,
    body: Body,
    sinks: SinkSet,
}

impl RequestView {
    pub fn new(method: Method, target: impl Into<String>, version: Version, headers: HeaderList) -> Self {
        Self {
            method,
            target: target.into(),
            version,
            headers,
            encrypted: false,
            body: Body::Empty,
            sinks: SinkSet::new(),
        }
    }

    pub fn from_parts(parts: hyper::http::request::Parts, body: Body, encrypted: bool) -> Self {
        let mut view = Self::new(
            parts.method,
            parts.uri.to_string(),
            parts.version,
            HeaderList::from_header_map(&parts.headers),
        );
        view.encrypted = encrypted;
        view.body = body;
        view
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request target exactly as received (origin-, absolute- or authority-form).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// `1.0` / `1.1` style version string.
    pub fn http_version(&self) -> &'static str {
        version_number(self.version)
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    /// Header value or the empty string. `referer` and `referrer` are aliases.
    pub fn get(&self, name: &str) -> &str {
        let lookup = |n: &str| self.headers.get(n);
        if name.eq_ignore_ascii_case("referer") || name.eq_ignore_ascii_case("referrer") {
            return lookup("referer").or_else(|| lookup("referrer")).unwrap_or("");
        }
        lookup(name).unwrap_or("")
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn absolute_target(&self) -> Option<url::Url> {
        let lower = self.target.get(..8).unwrap_or(&self.target).to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            url::Url::parse(&self.target).ok()
        } else {
            None
        }
    }

    /// Host and optional port, from `Host` or an absolute-form target.
    pub fn host(&self) -> String {
        let header = self
            .headers
            .get("host")
            .and_then(|h| h.split(',').next())
            .map(str::trim)
            .unwrap_or("");
        if !header.is_empty() {
            return header.to_owned();
        }
        self.absolute_target()
            .and_then(|url| {
                let host = url.host_str()?.to_owned();
                Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_default()
    }

    /// Host without the port; IPv6 literals lose their brackets.
    pub fn hostname(&self) -> String {
        split_host_port(&self.host()).0.to_owned()
    }

    pub fn port(&self) -> u16 {
        let host = self.host();
        split_host_port(&host)
            .1
            .and_then(|p| p.parse().ok())
            .unwrap_or(if self.secure() { 443 } else { 80 })
    }

    pub fn protocol(&self) -> String {
        if self.encrypted {
            return "https".to_owned();
        }
        let forwarded = self
            .headers
            .get("x-forwarded-proto")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if forwarded.is_empty() {
            "http".to_owned()
        } else {
            forwarded
        }
    }

    pub fn secure(&self) -> bool {
        self.protocol() == "https"
    }

    /// Path and query, whatever form the target was sent in.
    pub fn path(&self) -> String {
        match self.absolute_target() {
            Some(url) => match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_owned(),
            },
            None => self.target.clone(),
        }
    }

    pub fn origin(&self) -> String {
        format!("{}://{}", self.protocol(), self.host())
    }

    pub fn href(&self) -> String {
        if self.absolute_target().is_some() {
            return self.target.clone();
        }
        format!("{}{}", self.origin(), self.target)
    }

    pub fn delete_hop_by_hop_headers(&mut self) {
        self.headers.strip_hop_by_hop();
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn add_sink(&mut self, sink: BodySink) {
        self.sinks.push(sink);
    }

    pub fn take_sinks(&mut self) -> SinkSet {
        self.sinks.take()
    }
}

/// A response received from the remote or synthesized locally.
#[derive(Debug)]
pub struct ResponseView {
    status: StatusCode,
    headers: HeaderList,
    body: Body,
    sinks: SinkSet,
    synthetic: bool,
}

impl ResponseView {
    pub fn remote(status: StatusCode, headers: HeaderList, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
            sinks: SinkSet::new(),
            synthetic: false,
        }
    }

    /// A response that never touched the network.
    pub fn synthetic(status: StatusCode, headers: HeaderList, body: impl Into<Body>) -> Self {
        Self {
            synthetic: true,
            ..Self::remote(status, headers, body.into())
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn add_sink(&mut self, sink: BodySink) {
        self.sinks.push(sink);
    }

    pub fn take_sinks(&mut self) -> SinkSet {
        self.sinks.take()
    }
}

pub(crate) fn version_number(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    }
}

/// Splits `host[:port]`, understanding bracketed IPv6 literals.
pub(crate) fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':')),
            None => (rest, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, Some(port)),
        _ => (host, None),
    }
}

/// Formats an authority, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
