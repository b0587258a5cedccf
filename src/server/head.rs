//! First request head of a client connection, read before any context exists.

use bytes::BytesMut;
use hyper::{Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::headers::HeaderList;
use crate::http::message::RequestView;

pub(crate) const HEAD_MAX_SIZE: usize = 16 * 1024;
const HEAD_MAX_HEADERS: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeadError {
    /// Not a parseable HTTP/1.x request.
    Malformed,
    /// No complete head within `HEAD_MAX_SIZE`.
    TooLarge,
}

/// A parsed head and the number of buffer bytes it spans.
#[derive(Debug)]
pub(crate) struct Head {
    pub request: RequestView,
    pub len: usize,
}

impl Head {
    pub fn is_connect(&self) -> bool {
        self.request.method() == Method::CONNECT
    }
}

/// Reads into `buf` until a complete head is buffered. `Ok(None)` when the
/// client closed the connection before sending anything.
pub(crate) async fn read_head<S>(socket: &mut S, buf: &mut BytesMut) -> std::io::Result<Option<Result<Head, HeadError>>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match parse_head(buf) {
                Ok(Some(head)) => return Ok(Some(Ok(head))),
                Ok(None) if buf.len() >= HEAD_MAX_SIZE => return Ok(Some(Err(HeadError::TooLarge))),
                Ok(None) => {}
                Err(e) => return Ok(Some(Err(e))),
            }
        }
        if socket.read_buf(buf).await? == 0 {
            return Ok(if buf.is_empty() {
                None
            } else {
                Some(Err(HeadError::Malformed))
            });
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; HEAD_MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(HeadError::TooLarge),
        Err(_) => return Err(HeadError::Malformed),
    };

    let method = request
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(HeadError::Malformed)?;
    let target = request.path.ok_or(HeadError::Malformed)?;
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let headers: HeaderList = request
        .headers
        .iter()
        .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(Some(Head {
        request: RequestView::new(method, target, version, headers),
        len,
    }))
}

/// Answers with a bodiless status and lets the caller drop the connection.
pub(crate) async fn reject<S>(socket: &mut S, status_line: &str, extra_headers: &[(&str, &str)])
where
    S: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {status_line}\r\n");
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        tracing::debug!(error = %e, "Failed to write rejection");
        return;
    }
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_head_and_leftover() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n\x16\x03")
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let head = read_head(&mut server, &mut buf).await.unwrap().unwrap().unwrap();
        assert!(head.is_connect());
        assert_eq!(head.request.target(), "example.test:443");
        assert_eq!(&buf[head.len..], b"\x16\x03");
    }

    #[tokio::test]
    async fn split_head_is_reassembled() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let head = read_head(&mut server, &mut buf).await.unwrap().unwrap().unwrap();
            (head.request.get("host").to_owned(), head.is_connect())
        });
        client.write_all(b"GET http://a.test/ HTTP/1.1\r\nHo").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"st: a.test\r\n\r\n").await.unwrap();
        assert_eq!(reader.await.unwrap(), ("a.test".to_owned(), false));
    }

    #[tokio::test]
    async fn garbage_and_silence() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"\x16\x03\x01 not http\r\n\r\n").await.unwrap();
        let mut buf = BytesMut::new();
        let result = read_head(&mut server, &mut buf).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), HeadError::Malformed);

        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let mut buf = BytesMut::new();
        assert!(read_head(&mut server, &mut buf).await.unwrap().is_none());
    }
}
