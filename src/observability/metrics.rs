//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_contexts_total` (counter): contexts created, by `kind`
//! - `proxy_context_errors_total` (counter): failed contexts, by `kind` and `error`
//! - `proxy_connect_branch_total` (counter): CONNECT decisions, by `branch`
//! - `proxy_websocket_frames_total` (counter): relayed data frames, by `direction`
//! - `proxy_active_connections` (gauge): accepted client connections still open

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Installs the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_context(kind: &'static str) {
    metrics::counter!("proxy_contexts_total", "kind" => kind).increment(1);
}

pub fn record_context_error(kind: &'static str, error: &'static str) {
    metrics::counter!("proxy_context_errors_total", "kind" => kind, "error" => error).increment(1);
}

pub fn record_connect_branch(branch: &'static str) {
    metrics::counter!("proxy_connect_branch_total", "branch" => branch).increment(1);
}

pub fn record_websocket_frame(direction: &'static str) {
    metrics::counter!("proxy_websocket_frames_total", "direction" => direction).increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("proxy_active_connections").set(count as f64);
}
