//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Start listener (fallback port on contention)
//!
//! Shutdown (shutdown.rs):
//!     Running flag cleared → Stop accepting → Close sockets → Drain handlers
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger full stop
//! ```
//!
//! # Design Decisions
//! - Shutdown is idempotent: the running flag is swapped, never just read
//! - Shutdown has a timeout: handlers still alive after the deadline are logged

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
