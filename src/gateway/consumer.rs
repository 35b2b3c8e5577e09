//! The application-side seam of the gateway.
//!
//! The gateway owns sockets and the identity registry; everything a truck
//! says beyond heartbeats is handed to a [`Consumer`]. Callbacks run on the
//! connection's task and must not block.

use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

use crate::gateway::sender::CommandSender;
use crate::net::registry::RegistrySnapshot;
use crate::protocol::Message;

/// Error a consumer may return from [`Consumer::on_message`].
pub type ConsumerError = Box<dyn Error + Send + Sync>;

/// Receives inbound application messages and registry changes.
pub trait Consumer: Send + Sync + 'static {
    /// Called once when the gateway is created, with a handle for outbound commands.
    fn on_attach(&self, _sender: CommandSender) {}

    /// A decoded, non-heartbeat message arrived.
    fn on_message(&self, message: Message) -> Result<(), ConsumerError>;

    /// The registry gained, lost, or re-keyed an entry.
    fn on_registry_changed(&self, _snapshot: &RegistrySnapshot) {}
}

/// Run a consumer callback, containing panics.
///
/// Returns `None` if the callback panicked.
pub(crate) fn call_isolated<T>(callback: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            tracing::error!(callback, panic = %detail, "Consumer callback panicked");
            None
        }
    }
}

/// Event forwarded by [`ChannelConsumer`].
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Message(Message),
    RegistryChanged(RegistrySnapshot),
}

/// Consumer that forwards everything into an unbounded channel.
///
/// Lets async application code receive events without implementing the
/// synchronous callback trait.
#[derive(Debug)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<GatewayEvent>,
    sender: OnceLock<CommandSender>,
}

impl ChannelConsumer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Arc::new(Self {
            tx,
            sender: OnceLock::new(),
        });
        (consumer, rx)
    }

    /// Outbound handle, available once the consumer is attached to a server.
    pub fn sender(&self) -> Option<CommandSender> {
        self.sender.get().cloned()
    }
}

impl Consumer for ChannelConsumer {
    fn on_attach(&self, sender: CommandSender) {
        let _ = self.sender.set(sender);
    }

    fn on_message(&self, message: Message) -> Result<(), ConsumerError> {
        self.tx
            .send(GatewayEvent::Message(message))
            .map_err(|_| "event receiver dropped".into())
    }

    fn on_registry_changed(&self, snapshot: &RegistrySnapshot) {
        let _ = self.tx.send(GatewayEvent::RegistryChanged(snapshot.clone()));
    }
}
