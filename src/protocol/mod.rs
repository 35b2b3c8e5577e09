//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Socket bytes
//!     → frame.rs (4-byte header, length-prefixed payload)
//!     → codec.rs (header + payload → Message)
//!     → Message (sender, receiver, command, payload)
//!
//! Outbound:
//!     Message fields → codec.rs → frame bytes → socket
//! ```
//!
//! # Wire Format
//! ```text
//! [byte0][byte1][byte2][payload_len:u8][payload: payload_len bytes]
//! ```
//! Bytes 0-2 belong to the codec. The framing layer only reads byte 3.
//!
//! # Design Decisions
//! - Framing is independent of the codec: a malformed body never desyncs the stream
//! - The `Codec` trait is the seam for alternative encodings
//! - Protocol-level commands are named in `message::command`

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{BinaryCodec, Codec, CodecError};
pub use frame::{Frame, FrameError, FrameReader, ReadEvent};
pub use message::{command, Message, Payload};
