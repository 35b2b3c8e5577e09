//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, retry policy).
    pub listener: ListenerConfig,

    /// Per-connection settings (idle timeout, keepalive).
    pub connection: ConnectionConfig,

    /// Protocol settings.
    pub protocol: ProtocolConfig,

    /// Shutdown settings.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host to bind (e.g., "0.0.0.0").
    pub host: String,

    /// Port to bind. Zero lets the OS choose.
    pub port: u16,

    /// Listen backlog.
    pub backlog: u32,

    /// How long one accept waits before re-checking the running flag.
    pub accept_wait_ms: u64,

    /// Delay before the single retry when the address is in use.
    pub bind_retry_cooldown_ms: u64,

    /// Ports to scan when the configured port stays busy.
    pub fallback_ports: Option<PortRange>,
}

impl ListenerConfig {
    pub fn accept_wait(&self) -> Duration {
        Duration::from_millis(self.accept_wait_ms)
    }

    pub fn bind_retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.bind_retry_cooldown_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            backlog: 5,
            accept_wait_ms: 1_000,
            bind_retry_cooldown_ms: 5_000,
            fallback_ports: None,
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Per-connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Read idle timeout. Identified peers get a heartbeat check, anonymous peers are closed.
    pub idle_timeout_ms: u64,

    /// Unexpected errors tolerated in a row before the connection is closed.
    pub max_consecutive_errors: u32,

    /// TCP keepalive applied to accepted sockets.
    pub keepalive: KeepaliveConfig,
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 120_000,
            max_consecutive_errors: 16,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

/// TCP keepalive settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    /// Idle time before the first keepalive packet.
    pub idle_secs: u64,
    /// Interval between keepalive packets.
    pub interval_secs: u64,
    /// Unanswered keepalive packets before the OS drops the connection.
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: 60,
            interval_secs: 10,
            retries: 5,
        }
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Sender id the gateway uses for its own frames.
    pub server_id: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_id: "SERVER".to_string(),
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long `stop` waits for connection handlers to exit.
    pub drain_timeout_ms: u64,
}

impl LifecycleConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
