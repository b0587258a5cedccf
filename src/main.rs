//! intercept-proxy
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                   INTERCEPT PROXY                     │
//!   client ─────────▶│ listener ─▶ server (head sniff)                       │
//!                    │               ├─ CONNECT ─▶ HttpConnectContext        │
//!                    │               │     ├─ StreamContext ────────────────┼──▶ origin
//!                    │               │     └─ internal listener (TLS/plain)  │
//!                    │               │           └─ http::service ─┐         │
//!                    │               └─ HTTP ───▶ http::service ───┤         │
//!                    │                     HttpContext ◀───────────┤         │
//!                    │                     HttpUpgradeContext ◀────┘         │
//!                    │                       ├─ WebSocketSessionContext ─────┼──▶ origin
//!                    │                       └─ StreamContext ───────────────┼──▶ origin
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use intercept_proxy::config::{load_config, ConfigOverrides, ConfigWatcher, ProxyConfig};
use intercept_proxy::lifecycle::{signals, Shutdown};
use intercept_proxy::net::listener::Listener;
use intercept_proxy::observability::{logging, metrics};
use intercept_proxy::ProxyServer;

/// Intercepting forward proxy for HTTP, HTTPS and WebSocket traffic
#[derive(Parser, Debug)]
#[command(name = "intercept-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "INTERCEPT_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding `listener.bind_address`
    #[arg(short, long)]
    bind: Option<String>,

    /// Reload the configuration file when it changes
    #[arg(long, requires = "config")]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    let overrides = ConfigOverrides {
        bind_address: cli.bind.clone(),
    };
    overrides.apply(&mut config);

    logging::init(&config.observability.log_filter);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "intercept-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        decrypt_https = config.interception.decrypt_https,
        handle_upgrade = config.interception.handle_upgrade,
        handle_websocket = config.interception.handle_websocket,
        upstream_proxy = ?config.upstream_proxy.as_ref().map(|p| p.authority()),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;

    // The watcher handle must outlive the server.
    let (_watcher, updates) = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.with_overrides(overrides).run()?), Some(updates))
        }
        _ => (None, None),
    };

    let shutdown = Shutdown::new();
    let server = ProxyServer::new(config)?;
    let server_task = tokio::spawn(server.run(listener, updates, shutdown.subscribe()));

    signals::wait_for_signal().await;
    shutdown.trigger();
    server_task.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
