//! Structured logging.
//!
//! `tracing` events everywhere, rendered by the `tracing-subscriber` fmt layer.
//! The configured directives apply unless `RUST_LOG` is set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. Later calls are ignored.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
