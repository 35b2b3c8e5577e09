//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, socket options)
//!     → handler.rs (frame, decode, identify, heartbeat)
//!     → registry.rs (TEMP_<port> → device id)
//!
//! Connection States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - One task per connection; accepts never wait on a handler
//! - Each connection tracked for drain on stop
//! - Registry updates that touch several keys happen under one lock

pub mod connection;
pub mod handler;
pub mod listener;
pub mod registry;
