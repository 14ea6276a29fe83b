//! Frame assembly for both directions of the board's serial line.

use bytes::BytesMut;
use dgt_board::protocol::{CommandId, Frame, FrameCodec, Inbound};
use tokio_util::codec::Decoder;

use crate::capture::{Channel, SerialEvent};

/// Direction of serial communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to board (TX channel)
    HostToBoard,
    /// Board to host (RX channel)
    BoardToHost,
}

impl From<Channel> for Direction {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::TX => Direction::HostToBoard,
            Channel::RX => Direction::BoardToHost,
        }
    }
}

/// A unit of traffic recovered from the capture
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Host command bytes, command byte first
    Command { timestamp: f64, raw_bytes: Vec<u8> },
    /// Board message
    Message { timestamp: f64, frame: Frame },
    /// Bulk EE_MOVES transfer being skipped
    Drain {
        timestamp: f64,
        started: bool,
        bytes: usize,
    },
}

impl DecodedFrame {
    pub fn timestamp(&self) -> f64 {
        match self {
            DecodedFrame::Command { timestamp, .. }
            | DecodedFrame::Message { timestamp, .. }
            | DecodedFrame::Drain { timestamp, .. } => *timestamp,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            DecodedFrame::Command { .. } => Direction::HostToBoard,
            DecodedFrame::Message { .. } | DecodedFrame::Drain { .. } => Direction::BoardToHost,
        }
    }
}

/// Splits the host byte stream into commands.
///
/// Most commands are a single byte. Clock and LED commands carry a length
/// byte counting the bytes after it.
#[derive(Debug, Default)]
pub struct CommandStreamingParser {
    buffer: Vec<u8>,
    start_time: f64,
}

impl CommandStreamingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &SerialEvent) -> Option<DecodedFrame> {
        if self.buffer.is_empty() {
            self.start_time = event.timestamp;
        }
        self.buffer.push(event.data);

        let id = self.buffer[0];
        let complete = match CommandId::try_from(id) {
            Ok(CommandId::ClockMessage | CommandId::SetLeds) => self
                .buffer
                .get(1)
                .is_some_and(|&len| self.buffer.len() >= 2 + len as usize),
            _ => true,
        };
        if !complete {
            return None;
        }

        Some(DecodedFrame::Command {
            timestamp: self.start_time,
            raw_bytes: std::mem::take(&mut self.buffer),
        })
    }
}

/// Reassembles board messages with the driver's own frame codec.
#[derive(Debug, Default)]
pub struct MessageStreamingParser {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl MessageStreamingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_event(&mut self, event: &SerialEvent) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(&[event.data]);

        let mut frames = Vec::new();
        // the codec never fails; an error here would be a bug in it
        while let Ok(Some(inbound)) = self.codec.decode(&mut self.buffer) {
            let timestamp = event.timestamp;
            frames.push(match inbound {
                Inbound::Frame(frame) => DecodedFrame::Message { timestamp, frame },
                Inbound::DrainStarted { bytes } => DecodedFrame::Drain {
                    timestamp,
                    started: true,
                    bytes,
                },
                Inbound::DrainFinished { discarded, .. } => DecodedFrame::Drain {
                    timestamp,
                    started: false,
                    bytes: discarded,
                },
            });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(channel: Channel, timestamp: f64, data: u8) -> SerialEvent {
        SerialEvent {
            channel,
            timestamp,
            data,
            error: None,
        }
    }

    fn feed_commands(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut parser = CommandStreamingParser::new();
        bytes
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| parser.process_event(&event(Channel::TX, i as f64, b)))
            .map(|frame| match frame {
                DecodedFrame::Command { raw_bytes, .. } => raw_bytes,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn single_byte_commands() {
        assert_eq!(feed_commands(&[0x4b, 0x4d, 0x42]), vec![vec![0x4b], vec![0x4d], vec![0x42]]);
    }

    #[test]
    fn clock_and_led_commands_use_length_byte() {
        let stream = [0x2b, 0x03, 0x03, 0x09, 0x00, 0x60, 0x04, 0x01, 0x34, 0x24, 0x00, 0x45];
        assert_eq!(
            feed_commands(&stream),
            vec![
                vec![0x2b, 0x03, 0x03, 0x09, 0x00],
                vec![0x60, 0x04, 0x01, 0x34, 0x24, 0x00],
                vec![0x45],
            ]
        );
    }

    #[test]
    fn command_timestamp_is_first_byte() {
        let mut parser = CommandStreamingParser::new();
        assert!(parser.process_event(&event(Channel::TX, 1.0, 0x2b)).is_none());
        assert!(parser.process_event(&event(Channel::TX, 1.1, 0x03)).is_none());
        assert!(parser.process_event(&event(Channel::TX, 1.2, 0x03)).is_none());
        assert!(parser.process_event(&event(Channel::TX, 1.3, 0x03)).is_none());
        let frame = parser.process_event(&event(Channel::TX, 1.4, 0x00)).unwrap();
        assert_eq!(frame.timestamp(), 1.0);
    }

    #[test]
    fn board_messages_are_reassembled() {
        let mut parser = MessageStreamingParser::new();
        let bytes = [0x17, 0x93, 0x00, 0x05, 0x01, 0x15];
        let frames: Vec<DecodedFrame> = bytes
            .iter()
            .enumerate()
            .flat_map(|(i, &b)| parser.process_event(&event(Channel::RX, i as f64, b)))
            .collect();
        assert_eq!(
            frames,
            vec![DecodedFrame::Message {
                timestamp: 5.0,
                frame: Frame::new(0x93, vec![0x01, 0x15]),
            }]
        );
    }
}
