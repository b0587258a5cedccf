//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from the TOML file; every
//! field has a default so an empty file is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::upstream::UpstreamProxy;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Client-facing listener.
    pub listener: ListenerConfig,

    /// Which traffic is intercepted instead of tunneled.
    pub interception: InterceptionConfig,

    /// Proxy every outbound connection goes through.
    pub upstream_proxy: Option<UpstreamProxy>,

    /// Socket inactivity limits for streamed connections.
    pub timeouts: TimeoutConfig,

    /// Certificate served by interception listeners.
    pub tls: Option<TlsConfig>,

    /// Private listeners opened per intercepted CONNECT.
    pub internal_listeners: InternalListenerConfig,

    /// Proxy credentials; absent means no authentication.
    pub auth: Option<AuthConfig>,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Terminate TLS inside CONNECT tunnels.
    pub decrypt_https: bool,

    /// Sniff CONNECT tunnels for upgrade requests.
    pub handle_upgrade: bool,

    /// Relay WebSockets frame by frame instead of as raw bytes.
    pub handle_websocket: bool,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            decrypt_https: false,
            handle_upgrade: false,
            handle_websocket: true,
        }
    }
}

/// Timeout configuration. `0` disables a limit.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Client socket inactivity, in seconds.
    pub local_socket_secs: u64,

    /// Remote socket inactivity, in seconds.
    pub remote_socket_secs: u64,
}

impl TimeoutConfig {
    pub fn local(&self) -> Option<Duration> {
        (self.local_socket_secs > 0).then(|| Duration::from_secs(self.local_socket_secs))
    }

    pub fn remote(&self) -> Option<Duration> {
        (self.remote_socket_secs > 0).then(|| Duration::from_secs(self.remote_socket_secs))
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            local_socket_secs: 30,
            remote_socket_secs: 30,
        }
    }
}

/// PEM files for the internal certificate.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct InternalListenerConfig {
    /// Address internal listeners bind to.
    pub bind_host: String,

    /// Inclusive `[start, end]`; OS-assigned ports when absent.
    pub port_range: Option<[u16; 2]>,
}

impl Default for InternalListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub log_filter: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "intercept_proxy=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::upstream::ProxyProtocol;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.listener.bind_address, "127.0.0.1:8080");
        assert!(config.interception.handle_websocket);
        assert_eq!(config.timeouts.local(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parses_full_file() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:3128"

            [interception]
            decrypt_https = true
            handle_upgrade = true

            [upstream_proxy]
            host = "corp-proxy"
            port = 8443
            protocol = "https"

            [timeouts]
            local_socket_secs = 0

            [internal_listeners]
            port_range = [40000, 40100]

            [auth]
            username = "user"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.max_connections, 10_000);
        assert!(config.interception.decrypt_https && config.interception.handle_websocket);
        let proxy = config.upstream_proxy.unwrap();
        assert_eq!(proxy.protocol, ProxyProtocol::Https);
        assert_eq!(config.timeouts.local(), None);
        assert_eq!(config.timeouts.remote(), Some(Duration::from_secs(30)));
        assert_eq!(config.internal_listeners.port_range, Some([40000, 40100]));
        assert_eq!(config.auth.unwrap().username, "user");
    }
}
