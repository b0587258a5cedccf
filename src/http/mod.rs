//! HTTP message handling.
//!
//! # Data Flow
//! ```text
//! client connection
//!     → service.rs (hyper http1 server, auth, context selection)
//!     → message.rs (RequestView / ResponseView, bodies, taps)
//!     → local.rs (response head + body back to the hyper connection)
//! ```

pub mod headers;
pub mod local;
pub mod message;
pub mod service;

use bytes::Bytes;

pub use headers::HeaderList;
pub use local::{LocalResponse, PendingResponse};
pub use message::{Body, BodySink, RequestView, ResponseView};
pub use service::{serve_connection, ServeOptions};

/// Body type of every response handed back to hyper.
pub type ProxyBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::io::Error>;
