//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (tracking for graceful shutdown)
//!     → socket.rs (type erasure, replay of already-read bytes)
//!     → Hand off to the dispatcher
//!
//! Outbound
//!     → upstream.rs (direct, via upstream proxy, CONNECT tunnels)
//!
//! Interception
//!     → port.rs (private listener ports) → listener.rs (bind_internal)
//! ```

pub mod connection;
pub mod listener;
pub mod port;
pub mod socket;
pub mod upstream;
