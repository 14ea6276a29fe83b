//! Protocol dissection engine.

use colored::Colorize;
use dgt_board::clock::hms;
use dgt_board::protocol::command::{CLOCK_END, CLOCK_START};
use dgt_board::protocol::{
    ClockCommandId, ClockReport, CommandId, Frame, Message, MessageId,
};
use std::fmt;

use crate::serial::{DecodedFrame, Direction};

/// Dissected frame with decoded content
#[derive(Debug)]
pub struct DissectedFrame {
    pub timestamp: f64,
    pub direction: Direction,
    pub raw_data: Vec<u8>,
    pub content: String,
    pub status: FrameStatus,
}

/// Whether the frame decoded cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Valid,
    /// Length or markers do not match what the id requires
    Malformed,
    /// Id not known to the driver
    Unknown,
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStatus::Valid => write!(f, ""),
            FrameStatus::Malformed => write!(f, "{}", "MALFORMED".red()),
            FrameStatus::Unknown => write!(f, "{}", "UNKNOWN".yellow()),
        }
    }
}

/// Convert a decoded frame to a dissected frame
pub fn dissect_decoded_frame(frame: &DecodedFrame) -> DissectedFrame {
    let (raw_data, content, status) = match frame {
        DecodedFrame::Command { raw_bytes, .. } => {
            let (content, status) = dissect_command(raw_bytes);
            (raw_bytes.clone(), content, status)
        }
        DecodedFrame::Message { frame, .. } => {
            let (content, status) = dissect_message(frame);
            (frame.to_bytes(), content, status)
        }
        DecodedFrame::Drain { started, bytes, .. } => {
            let content = if *started {
                format!("EE_MOVES bulk transfer of {} bytes, skipping", bytes)
            } else {
                format!("EE_MOVES done, {} bytes skipped", bytes)
            };
            (Vec::new(), content, FrameStatus::Valid)
        }
    };

    DissectedFrame {
        timestamp: frame.timestamp(),
        direction: frame.direction(),
        raw_data,
        content,
        status,
    }
}

/// Describe one host command.
pub fn dissect_command(raw: &[u8]) -> (String, FrameStatus) {
    let Some(&id) = raw.first() else {
        return ("empty".into(), FrameStatus::Malformed);
    };
    let Ok(id) = CommandId::try_from(id) else {
        return (format!("command 0x{:02x}", id), FrameStatus::Unknown);
    };

    match id {
        CommandId::ClockMessage => dissect_clock_command(&raw[1..]),
        CommandId::SetLeds => match raw {
            [_, 0x04, on, from, to, CLOCK_END] => {
                let content = if *on == 0 {
                    "SET_LEDS off".to_string()
                } else if from == to {
                    format!("SET_LEDS on {}", led_square(*from))
                } else {
                    format!("SET_LEDS on {} {}", led_square(*from), led_square(*to))
                };
                (content, FrameStatus::Valid)
            }
            _ => ("SET_LEDS".into(), FrameStatus::Malformed),
        },
        other => (command_name(other).to_string(), FrameStatus::Valid),
    }
}

fn command_name(id: CommandId) -> &'static str {
    match id {
        CommandId::ClockMessage => "CLOCK",
        CommandId::SendBoard => "SEND_BRD",
        CommandId::ReturnSerialNumber => "RETURN_SERIALNR",
        CommandId::UpdateNice => "SEND_UPDATE_NICE",
        CommandId::BatteryStatus => "SEND_BATTERY_STATUS",
        CommandId::SendVersion => "SEND_VERSION",
        CommandId::ReturnLongSerialNumber => "RETURN_LONG_SERIALNR",
        CommandId::SetLeds => "SET_LEDS",
    }
}

/// Square of an LED index as seen from an unreversed board.
fn led_square(index: u8) -> String {
    if index >= 64 {
        return "none".into();
    }
    let file = (b'a' + index % 8) as char;
    let rank = 8 - index / 8;
    format!("{}{}", file, rank)
}

/// `args` starts at the length byte.
fn dissect_clock_command(args: &[u8]) -> (String, FrameStatus) {
    let [len, CLOCK_START, id, rest @ ..] = args else {
        return ("CLOCK".into(), FrameStatus::Malformed);
    };
    let Some((&CLOCK_END, body)) = rest.split_last() else {
        return ("CLOCK".into(), FrameStatus::Malformed);
    };
    if *len as usize != args.len() - 1 {
        return ("CLOCK".into(), FrameStatus::Malformed);
    }
    let Ok(id) = ClockCommandId::try_from(*id) else {
        return (format!("CLOCK 0x{:02x}", id), FrameStatus::Unknown);
    };

    let beep = |b: Option<&u8>| if b.is_some_and(|&b| b != 0) { " beep" } else { "" };
    let text = |t: &[u8]| t.iter().map(|&b| b as char).collect::<String>();

    let content = match (id, body) {
        (ClockCommandId::Version, []) => "CLOCK VERSION".to_string(),
        (ClockCommandId::End, []) => "CLOCK END".to_string(),
        (ClockCommandId::Ascii, [t @ .., b]) if t.len() == 8 => {
            format!("CLOCK ASCII {:?}{}", text(t), beep(Some(b)))
        }
        (ClockCommandId::Rev2Ascii, [t @ .., b]) if t.len() == 11 => {
            format!("CLOCK REV2_ASCII {:?}{}", text(t), beep(Some(b)))
        }
        (ClockCommandId::Display, [g @ .., icons, b]) if g.len() == 6 => format!(
            "CLOCK DISPLAY glyphs {:02x?} icons l:{} r:{}{}",
            g,
            (icons >> 3) & 0x07,
            icons & 0x07,
            beep(Some(b))
        ),
        (ClockCommandId::SetAndRun, [lh, lm, ls, rh, rm, rs, side]) => format!(
            "CLOCK SET_AND_RUN l:{}:{:02}:{:02} r:{}:{:02}:{:02} run:{}",
            lh,
            lm,
            ls,
            rh,
            rm,
            rs,
            match side {
                1 => "left",
                2 => "right",
                _ => "none",
            }
        ),
        (id, _) => return (format!("CLOCK {:?}", id), FrameStatus::Malformed),
    };
    (content, FrameStatus::Valid)
}

/// Describe one board message.
pub fn dissect_message(frame: &Frame) -> (String, FrameStatus) {
    let Ok(id) = MessageId::try_from(frame.id) else {
        return (format!("message 0x{:02x}", frame.id), FrameStatus::Unknown);
    };
    let mut status = match Message::expected_len(id) {
        Some(len) if len != frame.payload.len() => FrameStatus::Malformed,
        _ => FrameStatus::Valid,
    };

    let content = match Message::parse(frame) {
        Ok(Message::Version { major, minor }) => format!("VERSION {}.{}", major, minor),
        Ok(Message::Clock(report)) => dissect_clock_report(&report),
        Ok(Message::BoardDump(dump)) => format!("BOARD_DUMP {}", dump.fen()),
        Ok(Message::FieldUpdate { square, piece }) => {
            format!("FIELD_UPDATE {} piece 0x{:02x}", led_square(square), piece)
        }
        Ok(Message::SerialNumber(serial)) => format!("SERIALNR {:?}", serial),
        Ok(Message::LongSerialNumber(serial)) => format!("LONG_SERIALNR {:?}", serial),
        Ok(Message::BatteryStatus { percent }) => format!("BATTERY_STATUS {}%", percent),
        Ok(Message::Unhandled(id)) => format!("{:?}", id),
        Ok(Message::Unknown { id }) => {
            status = FrameStatus::Unknown;
            format!("message 0x{:02x}", id)
        }
        Err(e) => {
            status = FrameStatus::Malformed;
            e.to_string()
        }
    };
    (content, status)
}

fn dissect_clock_report(report: &ClockReport) -> String {
    match report {
        ClockReport::Ack(ack) => {
            let mut content = format!(
                "BWTIME ack {} {:?}",
                if ack.ok() { "ok" } else { "ERROR" },
                ack.kind()
            );
            if let Some((main, sub)) = ack.version() {
                content.push_str(&format!(" version {}.{}", main, sub));
            }
            if let Some(button) = ack.button() {
                content.push_str(&format!(" {}", button));
            }
            content
        }
        ClockReport::Time(time) => format!(
            "BWTIME l:{} r:{}{}",
            hms(time.left),
            hms(time.right),
            if time.connected() {
                format!(" lever {:?}", time.lever())
            } else {
                " disconnected".to_string()
            }
        ),
        ClockReport::Illegal(raw) => format!("BWTIME illegal {:02x?}", raw),
        ClockReport::Null => "BWTIME null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[0x42], "SEND_BRD")]
    #[test_case(&[0x4b], "SEND_UPDATE_NICE")]
    #[test_case(&[0x2b, 0x03, 0x03, 0x09, 0x00], "CLOCK VERSION")]
    #[test_case(&[0x2b, 0x03, 0x03, 0x03, 0x00], "CLOCK END")]
    #[test_case(&[0x60, 0x04, 0x01, 52, 36, 0x00], "SET_LEDS on e2 e4")]
    #[test_case(&[0x60, 0x04, 0x00, 0x40, 0x40, 0x00], "SET_LEDS off")]
    #[test_case(
        &[0x2b, 0x0a, 0x03, 0x0a, 0x00, 0x05, 0x00, 0x00, 0x04, 0x30, 0x01, 0x00],
        "CLOCK SET_AND_RUN l:0:05:00 r:0:04:48 run:left"
    )]
    fn commands(raw: &[u8], expected: &str) {
        let (content, status) = dissect_command(raw);
        assert_eq!(content, expected);
        assert_eq!(status, FrameStatus::Valid);
    }

    #[test]
    fn ascii_text_is_shown() {
        let mut raw = vec![0x2b, 0x0c, 0x03, 0x0c];
        raw.extend_from_slice(b"hello   ");
        raw.extend_from_slice(&[0x01, 0x00]);
        assert_eq!(
            dissect_command(&raw),
            ("CLOCK ASCII \"hello   \" beep".to_string(), FrameStatus::Valid)
        );
    }

    #[test]
    fn bad_clock_markers_are_malformed() {
        let (_, status) = dissect_command(&[0x2b, 0x03, 0x05, 0x09, 0x00]);
        assert_eq!(status, FrameStatus::Malformed);
    }

    #[test]
    fn unknown_command() {
        assert_eq!(dissect_command(&[0x7f]).1, FrameStatus::Unknown);
    }

    #[test]
    fn clock_time_message() {
        let frame = Frame::new(0x8d, vec![0x01, 0x30, 0x00, 0x00, 0x45, 0x30, 0x02]);
        assert_eq!(
            dissect_message(&frame),
            ("BWTIME l:0:45:30 r:1:30:00 lever RightDown".to_string(), FrameStatus::Valid)
        );
    }

    #[test]
    fn version_ack_message() {
        let frame = Frame::new(0x8d, vec![0x0a, 0x10, 0x09, 0x0a, 0x21, 0x00, 0x00]);
        assert_eq!(dissect_message(&frame).0, "BWTIME ack ok Version version 2.1");
    }

    #[test]
    fn short_battery_status_is_flagged() {
        let frame = Frame::new(0xa0, vec![58]);
        assert_eq!(
            dissect_message(&frame),
            ("BATTERY_STATUS 58%".to_string(), FrameStatus::Malformed)
        );
    }
}
