//! Startup orchestration.
//!
//! # Responsibilities
//! - Start the gateway on the configured address
//! - Fall back to a free port from the configured range on contention
//!
//! # Design Decisions
//! - Fail fast: any other startup error is fatal
//! - The fallback scan runs on the blocking pool (it binds std sockets)

use std::net::SocketAddr;

use crate::config::ListenerConfig;
use crate::gateway::GatewayServer;
use crate::net::listener::{self, ListenerError};

/// Start `server` on `config.host:config.port`, scanning `fallback_ports`
/// if that address stays in use after the bind retry.
pub async fn start_with_fallback(
    server: &GatewayServer,
    config: &ListenerConfig,
) -> Result<SocketAddr, ListenerError> {
    let err = match server.start(&config.host, config.port).await {
        Ok(addr) => return Ok(addr),
        Err(e) => e,
    };

    let Some(range) = config.fallback_ports.filter(|_| err.is_addr_in_use()) else {
        return Err(err);
    };

    tracing::warn!(
        port = config.port,
        start = range.start,
        end = range.end,
        "Configured port busy, scanning fallback range"
    );

    let host = config.host.clone();
    let found = tokio::task::spawn_blocking(move || {
        listener::find_available_port(&host, range.start, range.end)
    })
    .await
    .ok()
    .flatten();

    match found {
        Some(port) => server.start(&config.host, port).await,
        None => {
            tracing::error!(start = range.start, end = range.end, "No free port in fallback range");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, PortRange};
    use crate::gateway::ChannelConsumer;

    fn busy_listener_config(fallback: Option<PortRange>) -> (std::net::TcpListener, ListenerConfig) {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ListenerConfig {
            host: "127.0.0.1".into(),
            port: held.local_addr().unwrap().port(),
            bind_retry_cooldown_ms: 20,
            fallback_ports: fallback,
            ..ListenerConfig::default()
        };
        (held, config)
    }

    #[tokio::test]
    async fn contention_without_fallback_is_fatal() {
        let (_held, config) = busy_listener_config(None);
        let (consumer, _rx) = ChannelConsumer::new();
        let server = GatewayServer::with_binary_codec(GatewayConfig::default(), consumer);

        let err = start_with_fallback(&server, &config).await.unwrap_err();
        assert!(err.is_addr_in_use());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn contention_uses_fallback_range() {
        let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free = scratch.local_addr().unwrap().port();
        drop(scratch);

        let (_held, config) = busy_listener_config(Some(PortRange {
            start: free,
            end: free.saturating_add(20),
        }));
        let (consumer, _rx) = ChannelConsumer::new();
        let server = GatewayServer::with_binary_codec(GatewayConfig::default(), consumer);

        let addr = start_with_fallback(&server, &config).await.unwrap();
        assert_ne!(addr.port(), config.port);
        assert!(server.is_running());
        server.stop().await;
    }
}
