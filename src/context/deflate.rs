//! `permessage-deflate` (RFC 7692) under a frame codec that knows nothing about it.
//!
//! `DeflateSocket` sits between a raw upgraded socket and tungstenite. Reads
//! inflate compressed messages into plain frames; writes compress every
//! unfragmented data frame and mark it with RSV1. Control frames and
//! fragmented uncompressed messages pass through untouched.
//!
//! Each outgoing message is compressed with a fresh window, so the proxy
//! never relies on context takeover. Incoming messages are inflated with a
//! window that persists, which also decodes peers that do keep their context.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::http::headers::HeaderList;

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Appended to a compressed payload before inflating, stripped after deflating.
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_MESSAGE_SIZE: usize = 64 << 20;
const READ_CHUNK: usize = 8 * 1024;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;

fn offers(headers: &HeaderList) -> impl Iterator<Item = Vec<(String, Option<String>)>> + '_ {
    headers
        .get_all("sec-websocket-extensions")
        .flat_map(|v| v.split(','))
        .map(|offer| {
            offer
                .split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|param| match param.split_once('=') {
                    Some((name, value)) => (
                        name.trim().to_ascii_lowercase(),
                        Some(value.trim().trim_matches('"').to_owned()),
                    ),
                    None => (param.to_ascii_lowercase(), None),
                })
                .collect::<Vec<_>>()
        })
        .filter(|params| !params.is_empty())
}

/// Picks the first `permessage-deflate` offer the relay can honour and
/// returns the `Sec-WebSocket-Extensions` value answering it.
///
/// Offers limiting the server window below 15 bits are declined.
pub fn accept_offer(headers: &HeaderList) -> Option<String> {
    'offers: for params in offers(headers) {
        if params[0].0 != EXTENSION_NAME || params[0].1.is_some() {
            continue;
        }
        let mut server_window = false;
        for (name, value) in &params[1..] {
            match (name.as_str(), value.as_deref()) {
                ("server_no_context_takeover" | "client_no_context_takeover", None) => {}
                ("client_max_window_bits", _) => {}
                ("server_max_window_bits", Some("15")) => server_window = true,
                _ => continue 'offers,
            }
        }
        let mut response = format!("{EXTENSION_NAME}; server_no_context_takeover");
        if server_window {
            response.push_str("; server_max_window_bits=15");
        }
        return Some(response);
    }
    None
}

/// Checks an origin's answer to a bare `permessage-deflate` offer.
/// `Ok(true)` when compression was accepted.
pub fn accepted_by_origin(headers: &HeaderList) -> Result<bool, String> {
    let mut accepted = false;
    for params in offers(headers) {
        if params[0].0 != EXTENSION_NAME {
            return Err(format!("origin enabled unrequested extension {}", params[0].0));
        }
        if accepted {
            return Err("origin answered permessage-deflate twice".to_owned());
        }
        for (name, _) in &params[1..] {
            match name.as_str() {
                "server_no_context_takeover" | "client_no_context_takeover" | "server_max_window_bits" => {}
                other => return Err(format!("origin sent unsupported deflate parameter {other}")),
            }
        }
        accepted = true;
    }
    Ok(accepted)
}

/// Header of one frame, as found on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHead {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl FrameHead {
    fn parse(buf: &[u8]) -> io::Result<Option<Self>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (len, mut pos) = match buf[1] & 0x7f {
            126 if buf.len() >= 4 => (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
            127 if buf.len() >= 10 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(bytes), 10)
            }
            126 | 127 => return Ok(None),
            n => (u64::from(n), 2),
        };
        let mask = if buf[1] & 0x80 != 0 {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
            pos += 4;
            Some(key)
        } else {
            None
        };
        let payload_len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_MESSAGE_SIZE)
            .ok_or_else(|| invalid("websocket frame too large"))?;
        Ok(Some(Self {
            fin: buf[0] & 0x80 != 0,
            rsv1: buf[0] & 0x40 != 0,
            opcode: buf[0] & 0x0f,
            mask,
            header_len: pos,
            payload_len,
        }))
    }

    fn is_control(&self) -> bool {
        self.opcode & 0x08 != 0
    }

    fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Writes a final frame carrying `payload`, masked with `mask` when given.
fn encode_frame(out: &mut BytesMut, opcode: u8, rsv1: bool, mask: Option<[u8; 4]>, payload: &[u8]) {
    out.reserve(payload.len() + 14);
    let rsv = if rsv1 { 0x40 } else { 0 };
    out.extend_from_slice(&[0x80 | rsv | opcode]);
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.extend_from_slice(&[mask_bit | len as u8]),
        len if len <= usize::from(u16::MAX) => {
            out.extend_from_slice(&[mask_bit | 126]);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.extend_from_slice(&[mask_bit | 127]);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    if let Some(key) = mask {
        out.extend_from_slice(&key);
    }
    let payload_start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut out[payload_start..], key);
    }
}

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut compress = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let before = compress.total_in();
        compress
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        consumed += (compress.total_in() - before) as usize;
        if consumed == data.len() && out.len() < out.capacity() {
            break;
        }
    }
    if out.ends_with(&SYNC_TRAILER) {
        out.truncate(out.len() - SYNC_TRAILER.len());
    }
    Ok(out)
}

fn inflate(decompress: &mut Decompress, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut input = Vec::with_capacity(data.len() + SYNC_TRAILER.len());
    input.extend_from_slice(data);
    input.extend_from_slice(&SYNC_TRAILER);

    let mut out = Vec::with_capacity(data.len() * 2 + 64);
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(1024));
        }
        let (in_before, out_before) = (decompress.total_in(), decompress.total_out());
        let status = decompress
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|_| invalid("corrupt deflate payload"))?;
        let read = (decompress.total_in() - in_before) as usize;
        let written = decompress.total_out() - out_before;
        consumed += read;

        if out.len() > MAX_MESSAGE_SIZE {
            return Err(invalid("inflated websocket message too large"));
        }
        if status == Status::StreamEnd || (consumed == input.len() && out.len() < out.capacity()) {
            break;
        }
        if read == 0 && written == 0 && out.len() < out.capacity() {
            return Err(invalid("truncated deflate payload"));
        }
    }
    Ok(out)
}

/// A compressed message still waiting for its final fragment.
struct Partial {
    opcode: u8,
    data: Vec<u8>,
}

/// Socket adapter applying `permessage-deflate` to the frames crossing it.
pub struct DeflateSocket<S> {
    inner: S,
    /// Bytes read from `inner` that do not form a whole frame yet.
    raw: BytesMut,
    /// Plain frames ready for the reader.
    decoded: BytesMut,
    partial: Option<Partial>,
    inflater: Decompress,
    /// Bytes written by the codec that do not form a whole frame yet.
    pending: BytesMut,
    /// Encoded frames not yet accepted by `inner`.
    encoded: BytesMut,
    /// The codec is in the middle of a fragmented, uncompressed message.
    writing_fragments: bool,
}

impl<S> DeflateSocket<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            raw: BytesMut::new(),
            decoded: BytesMut::new(),
            partial: None,
            inflater: Decompress::new(false),
            pending: BytesMut::new(),
            encoded: BytesMut::new(),
            writing_fragments: false,
        }
    }

    /// Moves one complete frame from `raw` to `decoded`. `Ok(false)` when
    /// more bytes are needed.
    fn decode_frame(&mut self) -> io::Result<bool> {
        let Some(head) = FrameHead::parse(&self.raw)? else {
            return Ok(false);
        };
        if self.raw.len() < head.frame_len() {
            return Ok(false);
        }
        let frame = self.raw.split_to(head.frame_len());
        if head.is_control() || (self.partial.is_none() && !head.rsv1) {
            self.decoded.extend_from_slice(&frame);
            return Ok(true);
        }

        let mut payload = frame[head.header_len..].to_vec();
        if let Some(key) = head.mask {
            apply_mask(&mut payload, key);
        }
        let message = match self.partial.take() {
            Some(mut partial) => {
                if head.opcode != OP_CONTINUATION || head.rsv1 {
                    return Err(invalid("new message inside a compressed fragmented message"));
                }
                partial.data.extend_from_slice(&payload);
                partial
            }
            None => Partial {
                opcode: head.opcode,
                data: payload,
            },
        };
        if message.data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid("websocket message too large"));
        }
        if !head.fin {
            self.partial = Some(message);
            return Ok(true);
        }
        // Frames from a client stay masked for the codec, which insists on it.
        let plain = inflate(&mut self.inflater, &message.data)?;
        encode_frame(&mut self.decoded, message.opcode, false, head.mask, &plain);
        Ok(true)
    }

    /// Compresses every complete frame in `pending` into `encoded`.
    fn encode_pending(&mut self) -> io::Result<()> {
        while let Some(head) = FrameHead::parse(&self.pending)? {
            if self.pending.len() < head.frame_len() {
                break;
            }
            let frame = self.pending.split_to(head.frame_len());
            let data = matches!(head.opcode, OP_TEXT | OP_BINARY);
            if head.is_control() || !data || !head.fin || head.rsv1 || self.writing_fragments {
                if data && !head.fin {
                    self.writing_fragments = true;
                } else if head.opcode == OP_CONTINUATION && head.fin {
                    self.writing_fragments = false;
                }
                self.encoded.extend_from_slice(&frame);
                continue;
            }
            let mut payload = frame[head.header_len..].to_vec();
            if let Some(key) = head.mask {
                apply_mask(&mut payload, key);
            }
            let compressed = deflate(&payload)?;
            encode_frame(&mut self.encoded, head.opcode, true, head.mask, &compressed);
        }
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> DeflateSocket<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.encoded.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.encoded))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.encoded.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeflateSocket<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded[..n]);
                this.decoded.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.decode_frame()? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            if read.filled().is_empty() {
                // EOF: hand over a truncated frame as is and let the codec fail on it.
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                let rest = this.raw.split();
                this.decoded.extend_from_slice(&rest);
                continue;
            }
            this.raw.extend_from_slice(read.filled());
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeflateSocket<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        this.pending.extend_from_slice(buf);
        this.encode_pending()?;
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_drain(cx))?;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
