//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_config() {
        let config = parse_config(
            r#"
            [listener]
            host = "127.0.0.1"
            port = 7000

            [protocol]
            server_id = "HUB"
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.host, "127.0.0.1");
        assert_eq!(config.protocol.server_id, "HUB");
    }

    #[test]
    fn reports_parse_and_validation_errors() {
        assert!(matches!(
            parse_config("[listener\nport = 1"),
            Err(ConfigError::Parse(_))
        ));

        let err = parse_config("[listener]\nbacklog = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.len() == 1));
        assert!(err.to_string().contains("listener.backlog"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/fleet-gateway.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
