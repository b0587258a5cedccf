//! Intercepting forward proxy.
//!
//! Plain HTTP, CONNECT tunnels (optionally TLS-decrypted or sniffed for
//! upgrade requests) and WebSockets, each proxied by a connection context a
//! user-supplied handler can inspect and modify before calling `connect()`.

pub mod config;
pub mod context;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;
pub mod server;
pub mod tls;

pub use config::schema::ProxyConfig;
pub use context::{ConnectionContext, ContextError, ContextHandler};
pub use lifecycle::Shutdown;
pub use server::ProxyServer;
