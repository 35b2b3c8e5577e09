//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging for machine parsing
//! - Connection id and peer address flow through every connection event
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
