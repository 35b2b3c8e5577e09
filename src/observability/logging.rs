//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level at runtime
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global tracing subscriber.
///
/// Returns an error if a global subscriber is already set.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("fleet_gateway={}", config.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}
