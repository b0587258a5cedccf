//! Proxy authentication.
//!
//! # Data Flow
//! ```text
//! CONNECT head / hyper request
//!     → RequestView
//!     → Authenticator::authenticate(view, phase)
//!     → false ⇒ 407 + Proxy-Authenticate, no context is created
//! ```

pub mod auth;

pub use auth::{AllowAll, AuthPhase, Authenticator, BasicCredentials};
