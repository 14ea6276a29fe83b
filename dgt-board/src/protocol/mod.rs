//! DGT board wire protocol.
//!
//! # Framing
//!
//! Host to board, every command starts with a command byte (high bit clear),
//! optionally followed by a length byte and arguments.
//!
//! Board to host, every message is a frame:
//!
//! ```text
//! +------+----------+----------+----------------+
//! |  id  | len_hi:7 | len_lo:7 | payload (0-64) |
//! +------+----------+----------+----------------+
//! ```
//!
//! The id byte is the only byte with its high bit set. The 14-bit length
//! counts the three header bytes as well. There is no checksum; a stray
//! high-bit byte is the only sign that the stream lost sync.
//!
//! # Clock tunnel
//!
//! Clock commands travel inside a `CLOCK_MESSAGE` command and clock replies
//! (acks and time reports) arrive inside `BWTIME` messages.

pub mod codec;
pub mod command;
pub mod message;

use thiserror::Error;

pub use codec::{FrameCodec, Inbound};
pub use command::{
    ClockCommand, ClockCommandId, ClockIcons, ClockSide, Command, CommandId, EncodeError, Hms, Square,
};
pub use message::{Ack, AckKind, BoardDump, Button, ClockReport, ClockTime, Lever, Message};

/// Size of a frame header.
pub const HEADER_LEN: usize = 3;

/// Largest payload the board sends in a regular frame.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Bit marking a frame start; payload bytes never carry it.
pub const FRAME_START: u8 = 0x80;

/// Whether a byte can only be a frame start.
pub fn is_frame_start(byte: u8) -> bool {
    byte & FRAME_START != 0
}

/// One board-to-host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id, high bit set
    pub id: u8,
    /// Payload, high bit clear in every byte
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(id: u8, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// Encode the frame the way the board sends it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = self.payload.len() + HEADER_LEN;
        let mut bytes = Vec::with_capacity(total);
        bytes.push(self.id);
        bytes.push(((total >> 7) & 0x7f) as u8);
        bytes.push((total & 0x7f) as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Board message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    BoardDump = 0x86,
    BwTime = 0x8d,
    FieldUpdate = 0x8e,
    EeMoves = 0x8f,
    BusAddress = 0x90,
    SerialNumber = 0x91,
    Trademark = 0x92,
    Version = 0x93,
    BatteryStatus = 0xa0,
    LongSerialNumber = 0xa2,
}

/// Alternate id some captures show for the version reply.
pub const VERSION_ALIAS_ID: u8 = 0x8b;

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x86 => Ok(Self::BoardDump),
            0x8d => Ok(Self::BwTime),
            0x8e => Ok(Self::FieldUpdate),
            0x8f => Ok(Self::EeMoves),
            0x90 => Ok(Self::BusAddress),
            0x91 => Ok(Self::SerialNumber),
            0x92 => Ok(Self::Trademark),
            0x93 | VERSION_ALIAS_ID => Ok(Self::Version),
            0xa0 => Ok(Self::BatteryStatus),
            0xa2 => Ok(Self::LongSerialNumber),
            _ => Err(value),
        }
    }
}

/// Errors interpreting the payload of a well-framed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message 0x{id:02x} needs {expected} payload bytes, got {actual}")]
    PayloadTooShort {
        id: u8,
        expected: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_packs_total_length_in_two_septets() {
        let frame = Frame::new(0x93, vec![0x02, 0x00]);
        assert_eq!(frame.to_bytes(), vec![0x93, 0x00, 0x05, 0x02, 0x00]);

        let dump = Frame::new(0x86, vec![0; 64]);
        let bytes = dump.to_bytes();
        // 67 = 0b0_1000011
        assert_eq!(&bytes[..3], &[0x86, 0x00, 0x43]);
        assert_eq!(bytes.len(), 67);
    }

    #[test]
    fn message_ids() {
        assert_eq!(MessageId::try_from(0x93), Ok(MessageId::Version));
        assert_eq!(MessageId::try_from(0x8b), Ok(MessageId::Version));
        assert_eq!(MessageId::try_from(0xa2), Ok(MessageId::LongSerialNumber));
        assert_eq!(MessageId::try_from(0x85), Err(0x85));
    }
}
