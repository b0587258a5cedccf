//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Parse and validate a TOML document.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Command-line values that win over the file on every load, reloads included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind_address {
            config.listener.bind_address = bind.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_listed() {
        let err = parse_config("[listener]\nbind_address = \"\"\nmax_connections = 0\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: listener.bind_address: must not be empty, listener.max_connections: must be greater than 0"
        );
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        assert!(matches!(parse_config("[listener"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/intercept-proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = parse_config("[listener]\nbind_address = \"0.0.0.0:8080\"\n").unwrap();
        ConfigOverrides::default().apply(&mut config);
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");

        let overrides = ConfigOverrides {
            bind_address: Some("127.0.0.1:9000".to_owned()),
        };
        overrides.apply(&mut config);
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
    }
}
