//! Gateway facade.
//!
//! # Data Flow
//! ```text
//! Inbound:
//!     net::handler (decoded, non-heartbeat message)
//!         → consumer.rs (Consumer::on_message)
//!
//! Outbound:
//!     application → sender.rs (CommandSender::send_to)
//!         → registry lookup → codec encode → connection write lock
//!
//! Lifecycle:
//!     server.rs: start → quiesce → (start again) → stop
//! ```
//!
//! # Design Decisions
//! - The consumer gets a narrow `CommandSender`, not the whole server
//! - Consumer callbacks are synchronous; panics are contained per call

pub mod consumer;
pub mod sender;
pub mod server;

pub use consumer::{ChannelConsumer, Consumer, ConsumerError, GatewayEvent};
pub use sender::{CommandSender, SendError};
pub use server::GatewayServer;
