//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, port ranges ordered)
//! - Validate addresses and enumerated strings
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
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

impl std::error::Error for ValidationError {}

const LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.host.trim().is_empty() {
        errors.push(ValidationError::new("listener.host", "must not be empty"));
    }
    if listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be greater than 0"));
    }
    if listener.accept_wait_ms == 0 {
        errors.push(ValidationError::new("listener.accept_wait_ms", "must be greater than 0"));
    }
    if let Some(range) = listener.fallback_ports {
        if range.start == 0 || range.start > range.end {
            errors.push(ValidationError::new(
                "listener.fallback_ports",
                format!("invalid range {}..={}", range.start, range.end),
            ));
        }
    }

    let connection = &config.connection;
    if connection.idle_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "connection.idle_timeout_ms",
            "must be greater than 0",
        ));
    }
    if connection.max_consecutive_errors == 0 {
        errors.push(ValidationError::new(
            "connection.max_consecutive_errors",
            "must be greater than 0",
        ));
    }
    let keepalive = &connection.keepalive;
    if keepalive.enabled && (keepalive.idle_secs == 0 || keepalive.interval_secs == 0 || keepalive.retries == 0) {
        errors.push(ValidationError::new(
            "connection.keepalive",
            "idle_secs, interval_secs and retries must be greater than 0 when enabled",
        ));
    }

    if config.protocol.server_id.trim().is_empty() {
        errors.push(ValidationError::new("protocol.server_id", "must not be empty"));
    }

    if config.lifecycle.drain_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "lifecycle.drain_timeout_ms",
            "must be greater than 0",
        ));
    }

    let observability = &config.observability;
    if !LOG_FORMATS.contains(&observability.log_format.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_format",
            format!("unknown format '{}'", observability.log_format),
        ));
    }
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address '{}'", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PortRange;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.backlog = 0;
        config.listener.fallback_ports = Some(PortRange { start: 9000, end: 8000 });
        config.connection.idle_timeout_ms = 0;
        config.protocol.server_id = " ".into();
        config.observability.log_format = "xml".into();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "not-an-addr".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.backlog",
                "listener.fallback_ports",
                "connection.idle_timeout_ms",
                "protocol.server_id",
                "observability.log_format",
                "observability.metrics_address",
            ]
        );
    }

    #[test]
    fn disabled_keepalive_skips_its_checks() {
        let mut config = GatewayConfig::default();
        config.connection.keepalive.enabled = false;
        config.connection.keepalive.retries = 0;
        assert!(validate_config(&config).is_ok());
    }
}
