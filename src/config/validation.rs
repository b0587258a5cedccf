//! Configuration validation.
//!
//! Semantic checks only; serde has already handled syntax and types. Every
//! problem is reported, not just the first.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::schema::ProxyConfig;

/// One semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let bind = config.listener.bind_address.trim();
    if bind.is_empty() {
        errors.push(ValidationError::new("listener.bind_address", "must not be empty"));
    } else if bind.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{bind:?} is not an ip:port address"),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if let Some(proxy) = &config.upstream_proxy {
        if proxy.host.trim().is_empty() {
            errors.push(ValidationError::new("upstream_proxy.host", "must not be empty"));
        }
        if proxy.port == 0 {
            errors.push(ValidationError::new("upstream_proxy.port", "must not be 0"));
        }
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new("tls", "cert_path and key_path must both be set"));
        }
    }
    if config.interception.decrypt_https && config.tls.is_none() {
        errors.push(ValidationError::new(
            "interception.decrypt_https",
            "requires a [tls] certificate",
        ));
    }

    if config.internal_listeners.bind_host.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "internal_listeners.bind_host",
            format!("{:?} is not an ip address", config.internal_listeners.bind_host),
        ));
    }
    if let Some([start, end]) = config.internal_listeners.port_range {
        if start == 0 || start > end {
            errors.push(ValidationError::new(
                "internal_listeners.port_range",
                format!("[{start}, {end}] is not a valid range"),
            ));
        }
    }

    if let Some(auth) = &config.auth {
        if auth.username.is_empty() || auth.password.is_empty() {
            errors.push(ValidationError::new("auth", "username and password must both be set"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "is not an ip:port address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
