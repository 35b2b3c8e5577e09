//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → cloned into the server and its handlers at start
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::ConnectionConfig;
pub use schema::GatewayConfig;
pub use schema::ListenerConfig;
pub use schema::{KeepaliveConfig, LifecycleConfig, ObservabilityConfig, PortRange, ProtocolConfig};
