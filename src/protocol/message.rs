//! Decoded message representation.

use serde::{Deserialize, Serialize};

/// Structured key/value payload carried by a message.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Command names with protocol-level meaning, plus the application
/// commands understood by the bundled codec.
pub mod command {
    /// Liveness announcement sent by a device.
    pub const HELLO: &str = "HELLO";
    /// Server reply to `HELLO`.
    pub const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";
    /// Liveness check sent to an identified device that went quiet.
    pub const HEARTBEAT_CHECK: &str = "HEARTBEAT_CHECK";

    pub const ARRIVED: &str = "ARRIVED";
    pub const OBSTACLE: &str = "OBSTACLE";
    pub const STATUS_UPDATE: &str = "STATUS_UPDATE";
    pub const ASSIGN_MISSION: &str = "ASSIGN_MISSION";
    pub const FINISH_LOADING: &str = "FINISH_LOADING";
    pub const FINISH_UNLOADING: &str = "FINISH_UNLOADING";
    pub const FINISH_CHARGING: &str = "FINISH_CHARGING";
    pub const ACK_GATE_OPENED: &str = "ACK_GATE_OPENED";
    pub const EMERGENCY_TRIGGERED: &str = "EMERGENCY_TRIGGERED";

    pub const MISSION_ASSIGNED: &str = "MISSION_ASSIGNED";
    pub const RUN: &str = "RUN";
    pub const STOP: &str = "STOP";
    pub const GATE_OPENED: &str = "GATE_OPENED";
    pub const GATE_CLOSED: &str = "GATE_CLOSED";
    pub const START_LOADING: &str = "START_LOADING";
    pub const START_UNLOADING: &str = "START_UNLOADING";
    pub const START_CHARGING: &str = "START_CHARGING";
    pub const CHARGING_COMPLETED: &str = "CHARGING_COMPLETED";
    pub const CANCEL_MISSION: &str = "CANCEL_MISSION";
}

/// A successfully decoded message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Device that sent the message. `None` before the device has identified.
    pub sender: Option<String>,
    /// Intended recipient, if the codec carries one.
    pub receiver: Option<String>,
    /// Command name.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub payload: Payload,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// The sender identifier, ignoring empty strings.
    pub fn device_id(&self) -> Option<&str> {
        self.sender.as_deref().filter(|s| !s.is_empty())
    }

    pub fn is_hello(&self) -> bool {
        self.command == command::HELLO
    }
}
