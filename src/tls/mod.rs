//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! Interception (client side):
//!     ClientHello → acceptor.rs (read SNI)
//!     → certificates.rs (CertificateEngine picks a pair)
//!     → rustls ServerConfig → decrypted stream
//!
//! Origin side:
//!     socket → client.rs (web PKI or custom roots) → TLS stream
//! ```
//!
//! # Design Decisions
//! - `ring` is the only crypto provider; configs are built with it explicitly
//! - ALPN is pinned to `http/1.1` since decrypted traffic is served by an HTTP/1 codec

pub mod acceptor;
pub mod certificates;
pub mod client;

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub use acceptor::accept;
pub use certificates::{CertificateEngine, CertificateError, CertificatePair, StaticCertificates};
pub use client::TlsClient;

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
