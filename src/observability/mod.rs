//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every context produces:
//!     → logging.rs (structured events: context_id, kind, client, target)
//!     → metrics.rs (counters per context kind, error label, CONNECT branch)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Metrics go through the `metrics` facade; without an installed recorder they cost nothing
//! - `RUST_LOG` overrides the configured filter

pub mod logging;
pub mod metrics;
