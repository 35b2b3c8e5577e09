//! Semantic encoding of frames.
//!
//! `Codec` is the boundary between framing and meaning. `BinaryCodec` is the
//! bundled implementation used by the fleet devices:
//!
//! ```text
//! [sender:u8][receiver:u8][command:u8][len:u8][payload: compact JSON object]
//! ```
//!
//! Participant codes: `0x00` = none, `0x10` = server, `0x01..=0x0F` = `TRUCK_1..=TRUCK_15`.

use thiserror::Error;

use crate::protocol::frame::{HEADER_SIZE, LENGTH_OFFSET, MAX_PAYLOAD_SIZE};
use crate::protocol::message::{command, Message, Payload};

/// Errors reported by a codec. On decode, any error marks the frame as invalid.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("length byte says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Converts between frame bytes and messages.
pub trait Codec: Send + Sync + 'static {
    /// Decode a complete frame (header followed by payload).
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError>;

    /// Encode a message into a complete frame.
    fn encode(
        &self,
        sender: &str,
        receiver: &str,
        command: &str,
        payload: &Payload,
    ) -> Result<Vec<u8>, CodecError>;
}

const NO_PARTICIPANT: u8 = 0x00;
const SERVER_CODE: u8 = 0x10;
const TRUCK_PREFIX: &str = "TRUCK_";
const MAX_TRUCK: u8 = 0x0F;

const COMMANDS: &[(u8, &str)] = &[
    (0x01, command::HELLO),
    (0x02, command::HEARTBEAT_ACK),
    (0x03, command::HEARTBEAT_CHECK),
    (0x10, command::ARRIVED),
    (0x11, command::OBSTACLE),
    (0x12, command::STATUS_UPDATE),
    (0x13, command::ASSIGN_MISSION),
    (0x14, command::FINISH_LOADING),
    (0x15, command::FINISH_UNLOADING),
    (0x16, command::FINISH_CHARGING),
    (0x17, command::ACK_GATE_OPENED),
    (0x18, command::EMERGENCY_TRIGGERED),
    (0x20, command::MISSION_ASSIGNED),
    (0x21, command::RUN),
    (0x22, command::STOP),
    (0x23, command::GATE_OPENED),
    (0x24, command::GATE_CLOSED),
    (0x25, command::START_LOADING),
    (0x26, command::START_UNLOADING),
    (0x27, command::START_CHARGING),
    (0x28, command::CHARGING_COMPLETED),
    (0x29, command::CANCEL_MISSION),
];

/// Compact binary codec with a JSON object payload.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    server_id: String,
}

impl BinaryCodec {
    /// Create a codec that maps `server_id` to the server participant code.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn participant_code(&self, name: &str) -> Result<u8, CodecError> {
        if name.is_empty() {
            return Ok(NO_PARTICIPANT);
        }
        if name == self.server_id {
            return Ok(SERVER_CODE);
        }
        name.strip_prefix(TRUCK_PREFIX)
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|n| (1..=MAX_TRUCK).contains(n))
            .ok_or_else(|| CodecError::UnknownParticipant(name.to_string()))
    }

    fn participant_name(&self, code: u8) -> Result<Option<String>, CodecError> {
        match code {
            NO_PARTICIPANT => Ok(None),
            SERVER_CODE => Ok(Some(self.server_id.clone())),
            1..=MAX_TRUCK => Ok(Some(format!("{}{}", TRUCK_PREFIX, code))),
            other => Err(CodecError::UnknownParticipant(format!("0x{:02x}", other))),
        }
    }

    fn command_code(name: &str) -> Result<u8, CodecError> {
        COMMANDS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(code, _)| *code)
            .ok_or_else(|| CodecError::UnknownCommand(name.to_string()))
    }

    fn command_name(code: u8) -> Result<&'static str, CodecError> {
        COMMANDS
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .ok_or_else(|| CodecError::UnknownCommand(format!("0x{:02x}", code)))
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new("SERVER")
    }
}

impl Codec for BinaryCodec {
    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        if frame.len() < HEADER_SIZE {
            return Err(CodecError::TooShort(frame.len()));
        }
        let declared = frame[LENGTH_OFFSET] as usize;
        let body = &frame[HEADER_SIZE..];
        if body.len() != declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let sender = self.participant_name(frame[0])?;
        let receiver = self.participant_name(frame[1])?;
        let command = Self::command_name(frame[2])?;

        let payload = if body.is_empty() {
            Payload::new()
        } else {
            match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(other) => {
                    return Err(CodecError::InvalidPayload(format!(
                        "expected object, got {}",
                        other
                    )))
                }
                Err(e) => return Err(CodecError::InvalidPayload(e.to_string())),
            }
        };

        Ok(Message {
            sender,
            receiver,
            command: command.to_string(),
            payload,
        })
    }

    fn encode(
        &self,
        sender: &str,
        receiver: &str,
        command: &str,
        payload: &Payload,
    ) -> Result<Vec<u8>, CodecError> {
        let body = if payload.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(payload).map_err(|e| CodecError::InvalidPayload(e.to_string()))?
        };
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: body.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.push(self.participant_code(sender)?);
        frame.push(self.participant_code(receiver)?);
        frame.push(Self::command_code(command)?);
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
