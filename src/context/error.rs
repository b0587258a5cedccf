//! Error taxonomy shared by every connection context.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::tls::CertificateError;

/// Which leg of a proxied exchange an I/O failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The client socket accepted by the proxy.
    Local,
    /// The socket opened towards the origin or the upstream proxy.
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Failure of a context's `connect()`.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The client sent something the context cannot proxy.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The upstream proxy answered a tunnel request with something other than `200`.
    #[error("upstream proxy refused CONNECT {target} with status {status}")]
    UpstreamProxy { target: String, status: u16 },

    /// A socket on either leg errored; the peer leg has been torn down.
    #[error("{side} transport error: {source}")]
    Transport {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// The private listener used for interception could not be bound or bridged.
    #[error("internal listener error: {0}")]
    InternalListener(#[source] io::Error),

    /// TLS handshake with the client or the origin failed.
    #[error("tls error: {0}")]
    Tls(#[source] io::Error),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl ContextError {
    pub fn local(source: io::Error) -> Self {
        ContextError::Transport {
            side: Side::Local,
            source,
        }
    }

    pub fn remote(source: io::Error) -> Self {
        ContextError::Transport {
            side: Side::Remote,
            source,
        }
    }

    pub fn transport(side: Side, source: io::Error) -> Self {
        ContextError::Transport { side, source }
    }

    /// Wraps a non-I/O error (hyper, tungstenite) raised on the given leg.
    pub fn other<E>(side: Side, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ContextError::Transport {
            side,
            source: io::Error::other(error),
        }
    }

    /// Stable label used as the `error` metrics dimension.
    pub fn label(&self) -> &'static str {
        match self {
            ContextError::ProtocolViolation(_) => "protocol_violation",
            ContextError::UpstreamProxy { .. } => "upstream_proxy",
            ContextError::Transport { .. } => "transport",
            ContextError::InternalListener(_) => "internal_listener",
            ContextError::Tls(_) => "tls",
            ContextError::Certificate(_) => "certificate",
        }
    }
}

/// Failure raised by a WebSocket frame transform. Never leaves the pipeline.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame rejected: {0}")]
    Rejected(String),

    #[error("text frame is not valid UTF-8")]
    InvalidText,
}
