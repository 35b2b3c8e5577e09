//! fleet-gateway
//!
//! TCP gateway between a fleet of trucks and the dispatch logic.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────┐
//!                      │                 FLEET GATEWAY                 │
//!                      │                                               │
//!     Truck frames     │  ┌──────────┐   ┌──────────┐   ┌──────────┐   │
//!     ─────────────────┼─▶│   net    │──▶│ protocol │──▶│ gateway  │───┼──▶ Consumer
//!                      │  │ listener │   │  frame + │   │ consumer │   │
//!                      │  │ handler  │   │  codec   │   │          │   │
//!                      │  └────┬─────┘   └──────────┘   └──────────┘   │
//!                      │       │ HELLO → HEARTBEAT_ACK                 │
//!                      │       ▼                                       │
//!                      │  ┌──────────┐                  ┌──────────┐   │
//!     Commands         │  │ registry │◀─────────────────│  sender  │◀──┼─── send_to
//!     ◀────────────────┼──│ TEMP_/id │                  │          │   │
//!                      │  └──────────┘                  └──────────┘   │
//!                      │                                               │
//!                      │  config · lifecycle · observability           │
//!                      └───────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use fleet_gateway::config::{load_config, validation::validate_config, ConfigError, GatewayConfig};
use fleet_gateway::gateway::{ChannelConsumer, GatewayEvent, GatewayServer};
use fleet_gateway::lifecycle::{signals, startup};
use fleet_gateway::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "fleet-gateway", version, about = "TCP gateway for fleet trucks")]
struct Args {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        config.listener.host = host;
    }
    if let Some(port) = args.port {
        config.listener.port = port;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fleet-gateway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let (consumer, mut events) = ChannelConsumer::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GatewayEvent::Message(message) => tracing::info!(
                    sender = ?message.sender,
                    command = %message.command,
                    payload = %serde_json::Value::Object(message.payload),
                    "Message received"
                ),
                GatewayEvent::RegistryChanged(snapshot) => tracing::debug!(
                    connected = ?snapshot.keys().collect::<Vec<_>>(),
                    "Registry changed"
                ),
            }
        }
    });

    let listener_config = config.listener.clone();
    let server = GatewayServer::with_binary_codec(config, consumer);
    let addr = startup::start_with_fallback(&server, &listener_config).await?;
    tracing::info!(address = %addr, "Gateway ready");

    signals::wait_for_signal().await?;
    server.stop().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
