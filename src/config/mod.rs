//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → server rebuilds its shared state and swaps it in
//!     → contexts created afterwards observe the new flags
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - A config that fails to load never replaces the running one

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError, ConfigOverrides};
pub use schema::{
    AuthConfig, InterceptionConfig, InternalListenerConfig, ListenerConfig, ObservabilityConfig, ProxyConfig,
    TimeoutConfig, TlsConfig,
};
pub use watcher::ConfigWatcher;
