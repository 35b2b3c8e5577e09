//! TCP gateway for a fleet of autonomous trucks.
//!
//! Devices connect over plain TCP and exchange small binary frames. The
//! gateway tracks which socket belongs to which device, answers heartbeats,
//! checks on quiet devices, and hands every other message to a [`Consumer`].

pub mod config;
pub mod gateway;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;

pub use config::GatewayConfig;
pub use gateway::{ChannelConsumer, CommandSender, Consumer, GatewayEvent, GatewayServer, SendError};
pub use lifecycle::Shutdown;
pub use net::registry::RegistrySnapshot;
pub use protocol::{BinaryCodec, Codec, Message, Payload};
