//! Board-to-host messages.

use std::fmt;

use super::{Frame, MessageId, ProtocolError};

/// Ack code prefix of a successful clock reply.
pub const ACK_OK: u8 = 0x10;

/// Low nibble marking a clock reply as an ack instead of a time report.
const ACK_MARKER: u8 = 0x0a;

/// A parsed board message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version { major: u8, minor: u8 },
    Clock(ClockReport),
    BoardDump(BoardDump),
    /// A piece was lifted or placed. The square is reported but only the
    /// fact that something moved is used.
    FieldUpdate { square: u8, piece: u8 },
    SerialNumber(String),
    LongSerialNumber(String),
    BatteryStatus { percent: u8 },
    /// Known id this driver has no use for
    Unhandled(MessageId),
    Unknown { id: u8 },
}

impl Message {
    /// Interpret a frame.
    ///
    /// Payloads longer than expected are accepted; the board pads some
    /// replies. Shorter ones are an error.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let Ok(id) = MessageId::try_from(frame.id) else {
            return Ok(Message::Unknown { id: frame.id });
        };
        let p = &frame.payload;

        let need = |expected: usize| {
            if p.len() < expected {
                Err(ProtocolError::PayloadTooShort {
                    id: frame.id,
                    expected,
                    actual: p.len(),
                })
            } else {
                Ok(())
            }
        };

        let message = match id {
            MessageId::Version => {
                need(2)?;
                Message::Version {
                    major: p[0],
                    minor: p[1],
                }
            }
            MessageId::BwTime => {
                need(7)?;
                let mut raw = [0u8; 7];
                raw.copy_from_slice(&p[..7]);
                Message::Clock(ClockReport::parse(raw))
            }
            MessageId::BoardDump => {
                need(64)?;
                let mut squares = [0u8; 64];
                squares.copy_from_slice(&p[..64]);
                Message::BoardDump(BoardDump { squares })
            }
            MessageId::FieldUpdate => {
                need(2)?;
                Message::FieldUpdate {
                    square: p[0],
                    piece: p[1],
                }
            }
            MessageId::SerialNumber => {
                need(5)?;
                Message::SerialNumber(ascii(&p[..5]))
            }
            MessageId::LongSerialNumber => {
                need(10)?;
                Message::LongSerialNumber(ascii(&p[..10]))
            }
            MessageId::BatteryStatus => {
                need(1)?;
                Message::BatteryStatus { percent: p[0] }
            }
            MessageId::EeMoves | MessageId::BusAddress | MessageId::Trademark => {
                Message::Unhandled(id)
            }
        };
        Ok(message)
    }

    /// Payload length the board is documented to send for this id.
    pub fn expected_len(id: MessageId) -> Option<usize> {
        match id {
            MessageId::Version | MessageId::FieldUpdate => Some(2),
            MessageId::BwTime => Some(7),
            MessageId::BoardDump => Some(64),
            MessageId::SerialNumber => Some(5),
            MessageId::LongSerialNumber => Some(10),
            MessageId::BatteryStatus => Some(9),
            MessageId::EeMoves | MessageId::BusAddress | MessageId::Trademark => None,
        }
    }
}

fn ascii(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Whether a long serial number announces a Revelation II that can host the
/// clock on its own controller ("3.250010001" yes, "0000000001" no).
pub fn long_serial_supports_pi(serial: &str) -> bool {
    serial
        .get(..4)
        .and_then(|v| v.trim().parse::<f32>().ok())
        .is_some_and(|version| version >= 3.25)
}

/// Contents of a BWTIME message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockReport {
    /// Reply to a clock command
    Ack(Ack),
    /// Both sides' remaining time
    Time(ClockTime),
    /// A time report with fields out of range
    Illegal([u8; 7]),
    /// All zero; sent by some boards without a clock
    Null,
}

impl ClockReport {
    pub fn parse(m: [u8; 7]) -> Self {
        if m[0] & 0x0f == ACK_MARKER || m[3] & 0x0f == ACK_MARKER {
            return ClockReport::Ack(Ack::from_payload(&m));
        }
        if m.iter().all(|&b| b == 0) {
            return ClockReport::Null;
        }

        let bcd = |b: u8| (b >> 4) as u32 * 10 + (b & 0x0f) as u32;
        let (rh, rm, rs) = ((m[0] & 0x0f) as u32, bcd(m[1]), bcd(m[2]));
        let (lh, lm, ls) = ((m[3] & 0x0f) as u32, bcd(m[4]), bcd(m[5]));
        if rh > 9 || lh > 9 || rm > 59 || lm > 59 || rs > 59 || ls > 59 {
            return ClockReport::Illegal(m);
        }

        ClockReport::Time(ClockTime {
            left: lh * 3600 + lm * 60 + ls,
            right: rh * 3600 + rm * 60 + rs,
            status: m[6] & 0x3f,
        })
    }
}

/// Remaining time of both sides in seconds, plus the clock status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub left: u32,
    pub right: u32,
    pub status: u8,
}

impl ClockTime {
    /// The clock is attached to the board. A detached clock reports zeros.
    pub fn connected(&self) -> bool {
        self.status & 0x20 == 0
    }

    pub fn lever(&self) -> Lever {
        if self.status & 0x02 != 0 {
            Lever::RightDown
        } else {
            Lever::LeftDown
        }
    }
}

/// Position of the clock's see-saw lever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lever {
    RightDown,
    LeftDown,
}

/// A button event from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    /// One of the five front keys, 0 (leftmost) to 4
    Key(u8),
    /// Keys 0 and 4 pressed together
    Combo,
    Lever(Lever),
}

impl Button {
    /// Numeric button code as consumers know it.
    pub fn code(&self) -> i32 {
        match self {
            Button::Key(k) => *k as i32,
            Button::Combo => 0x11,
            Button::Lever(Lever::RightDown) => -0x40,
            Button::Lever(Lever::LeftDown) => 0x40,
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Button::Key(k) => write!(f, "button {}", k),
            Button::Combo => write!(f, "button 0+4"),
            Button::Lever(Lever::RightDown) => write!(f, "lever right down"),
            Button::Lever(Lever::LeftDown) => write!(f, "lever left down"),
        }
    }
}

/// Clock ack kinds, the second ack code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Display,
    Icon,
    End,
    ButtonNone,
    Version,
    SetAndRun,
    Beep,
    Ascii,
    Ready,
    Button,
    Mode,
    NotInMode,
    Other(u8),
}

impl From<u8> for AckKind {
    fn from(code: u8) -> Self {
        match code {
            0x01 => AckKind::Display,
            0x02 => AckKind::Icon,
            0x03 => AckKind::End,
            0x08 => AckKind::ButtonNone,
            0x09 => AckKind::Version,
            0x0a => AckKind::SetAndRun,
            0x0b => AckKind::Beep,
            0x0c => AckKind::Ascii,
            0x81 => AckKind::Ready,
            0x88 => AckKind::Button,
            0x8a => AckKind::Mode,
            0x90 => AckKind::NotInMode,
            other => AckKind::Other(other),
        }
    }
}

/// A clock ack.
///
/// The clock can only send seven-bit bytes, so the high bits of the four
/// ack codes travel in the marker bytes 0 and 3 of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub codes: [u8; 4],
}

impl Ack {
    pub fn from_payload(m: &[u8; 7]) -> Self {
        Self {
            codes: [
                (m[1] & 0x7f) | ((m[3] << 3) & 0x80),
                (m[2] & 0x7f) | ((m[3] << 2) & 0x80),
                (m[4] & 0x7f) | ((m[0] << 3) & 0x80),
                (m[5] & 0x7f) | ((m[0] << 2) & 0x80),
            ],
        }
    }

    pub fn ok(&self) -> bool {
        self.codes[0] == ACK_OK
    }

    pub fn kind(&self) -> AckKind {
        AckKind::from(self.codes[1])
    }

    /// Whether the ack answers a specific clock command rather than
    /// reporting an event.
    pub fn is_reply(&self) -> bool {
        self.codes[1] < 0x80
    }

    /// Main and sub version of a version ack.
    pub fn version(&self) -> Option<(u8, u8)> {
        (self.kind() == AckKind::Version).then(|| (self.codes[2] >> 4, self.codes[2] & 0x0f))
    }

    /// Key pressed, for a button ack.
    ///
    /// The fourth code names the highest key involved; combinations show up
    /// in the third. Only the 0+4 combination is reported as such.
    pub fn button(&self) -> Option<Button> {
        if self.kind() != AckKind::Button {
            return None;
        }
        match self.codes[3] {
            49 => Some(Button::Key(0)),
            52 => Some(Button::Key(1)),
            51 => Some(Button::Key(2)),
            50 => Some(Button::Key(3)),
            53 if self.codes[2] == 69 => Some(Button::Combo),
            53 => Some(Button::Key(4)),
            _ => None,
        }
    }
}

/// Board contents, a8 first, one nibble-coded piece per square.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDump {
    pub squares: [u8; 64],
}

/// Piece symbol of a square code. 0x0d to 0x0f are special pieces.
pub fn piece_symbol(code: u8) -> char {
    const SYMBOLS: &[u8; 16] = b".PRNBKQprnbkq$%&";
    SYMBOLS[(code & 0x0f) as usize] as char
}

impl BoardDump {
    /// One symbol per square, `.` for empty.
    pub fn symbols(&self) -> String {
        self.squares.iter().map(|&c| piece_symbol(c)).collect()
    }

    /// Piece placement part of a FEN, not flipped for board orientation.
    /// Special pieces count as empty squares.
    pub fn fen(&self) -> String {
        let mut fen = String::with_capacity(72);
        for (r, rank) in self.squares.chunks(8).enumerate() {
            if r > 0 {
                fen.push('/');
            }
            let mut empty = 0;
            for &code in rank {
                if code != 0 && code < 0x0d {
                    if empty > 0 {
                        fen.push_str(&empty.to_string());
                        empty = 0;
                    }
                    fen.push(piece_symbol(code));
                } else {
                    empty += 1;
                }
            }
            if empty > 0 {
                fen.push_str(&empty.to_string());
            }
        }
        fen
    }
}

impl fmt::Display for BoardDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbols = self.symbols();
        for (i, rank) in symbols.as_bytes().chunks(8).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", String::from_utf8_lossy(rank))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const START: [u8; 64] = {
        let mut b = [0u8; 64];
        let back_black = [8, 9, 10, 12, 11, 10, 9, 8];
        let back_white = [2, 3, 4, 6, 5, 4, 3, 2];
        let mut i = 0;
        while i < 8 {
            b[i] = back_black[i];
            b[8 + i] = 7;
            b[48 + i] = 1;
            b[56 + i] = back_white[i];
            i += 1;
        }
        b
    };

    fn expand(fen: &str) -> String {
        fen.chars()
            .filter(|&c| c != '/')
            .flat_map(|c| match c.to_digit(10) {
                Some(n) => vec!['.'; n as usize],
                None => vec![c],
            })
            .collect()
    }

    #[test]
    fn version_message() {
        let frame = Frame::new(0x93, vec![0x02, 0x00]);
        assert_eq!(
            Message::parse(&frame),
            Ok(Message::Version { major: 2, minor: 0 })
        );
    }

    #[test]
    fn short_payload_is_an_error() {
        let frame = Frame::new(0x8d, vec![0x01, 0x02]);
        assert_eq!(
            Message::parse(&frame),
            Err(ProtocolError::PayloadTooShort {
                id: 0x8d,
                expected: 7,
                actual: 2
            })
        );
    }

    #[test]
    fn unknown_ids_are_not_errors() {
        assert_eq!(
            Message::parse(&Frame::new(0x85, vec![1])),
            Ok(Message::Unknown { id: 0x85 })
        );
        assert_eq!(
            Message::parse(&Frame::new(0x92, vec![b'D', b'G', b'T'])),
            Ok(Message::Unhandled(MessageId::Trademark))
        );
    }

    #[test]
    fn time_report() {
        let report = ClockReport::parse([0x01, 0x30, 0x00, 0x00, 0x45, 0x30, 0x00]);
        let ClockReport::Time(time) = report else {
            panic!("expected time, got {:?}", report);
        };
        assert_eq!(time.right, 5400);
        assert_eq!(time.left, 2730);
        assert!(time.connected());
        assert_eq!(time.lever(), Lever::LeftDown);
    }

    #[test]
    fn time_status_bits() {
        let ClockReport::Time(time) = ClockReport::parse([0, 0, 0x01, 0, 0, 0, 0x22]) else {
            panic!("expected time");
        };
        assert!(!time.connected());
        assert_eq!(time.lever(), Lever::RightDown);
    }

    #[test_case([0x01, 0x60, 0x00, 0x00, 0x00, 0x00, 0x00]; "minutes")]
    #[test_case([0x00, 0x00, 0x5f, 0x00, 0x00, 0x01, 0x00]; "seconds")]
    #[test_case([0x00, 0x00, 0x01, 0x0c, 0x00, 0x00, 0x00]; "hours")]
    fn out_of_range_fields_are_illegal(payload: [u8; 7]) {
        assert_eq!(ClockReport::parse(payload), ClockReport::Illegal(payload));
    }

    #[test]
    fn all_zero_is_null() {
        assert_eq!(ClockReport::parse([0; 7]), ClockReport::Null);
    }

    #[test]
    fn ack_codes_collect_high_bits_from_marker_bytes() {
        // version ack 0x10 0x09 0x21 from a clock that sets no high bits
        let report = ClockReport::parse([0x0a, 0x10, 0x09, 0x00, 0x21, 0x00, 0x00]);
        let ClockReport::Ack(ack) = report else {
            panic!("expected ack");
        };
        assert!(ack.ok());
        assert_eq!(ack.kind(), AckKind::Version);
        assert_eq!(ack.version(), Some((2, 1)));
        assert!(ack.is_reply());

        // bits 4 and 5 of byte 3 carry the high bits of codes 0 and 1
        let ack = Ack::from_payload(&[0x0a, 0x08, 0x08, 0x3a, 0x00, 0x00, 0x00]);
        assert_eq!(ack.codes[0], 0x88);
        assert_eq!(ack.codes[1], 0x88);
        assert_eq!(ack.kind(), AckKind::Button);
        assert!(!ack.ok());
    }

    #[test_case(0, 49, Some(Button::Key(0)))]
    #[test_case(0, 52, Some(Button::Key(1)))]
    #[test_case(0, 51, Some(Button::Key(2)))]
    #[test_case(0, 50, Some(Button::Key(3)))]
    #[test_case(65, 53, Some(Button::Key(4)))]
    #[test_case(69, 53, Some(Button::Combo))]
    #[test_case(0, 12, None)]
    fn button_acks(code2: u8, code3: u8, expected: Option<Button>) {
        let ack = Ack {
            codes: [ACK_OK, 0x88, code2, code3],
        };
        assert_eq!(ack.button(), expected);
    }

    #[test]
    fn button_codes() {
        assert_eq!(Button::Combo.code(), 0x11);
        assert_eq!(Button::Lever(Lever::RightDown).code(), -0x40);
        assert_eq!(Button::Lever(Lever::LeftDown).code(), 0x40);
        assert_eq!(Button::Key(3).code(), 3);
    }

    #[test]
    fn ack_kinds() {
        assert_eq!(AckKind::from(0x81), AckKind::Ready);
        assert_eq!(AckKind::from(0x90), AckKind::NotInMode);
        assert_eq!(AckKind::from(0x42), AckKind::Other(0x42));
    }

    #[test]
    fn start_position_fen() {
        let dump = BoardDump { squares: START };
        assert_eq!(dump.fen(), "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR");
        assert_eq!(dump.symbols().len(), 64);
        assert!(dump.to_string().starts_with("rnbqkbnr\npppppppp\n"));
    }

    #[test]
    fn fen_expands_back_to_symbols() {
        let mut squares = START;
        squares[12] = 0;
        squares[28] = 7;
        squares[33] = 6;
        squares[63] = 0;
        let dump = BoardDump { squares };
        let fen = dump.fen();
        assert_eq!(fen, "rnbqkbnr/pppp1ppp/8/4p3/1Q6/8/PPPPPPPP/RNBQKBN1");
        assert_eq!(expand(&fen), dump.symbols());
    }

    #[test]
    fn special_pieces_are_empty_in_fen() {
        let mut squares = [0u8; 64];
        squares[0] = 0x0d;
        squares[1] = 0x0f;
        squares[2] = 0x05;
        let dump = BoardDump { squares };
        assert_eq!(&dump.symbols()[..3], "$&K");
        assert_eq!(dump.fen(), "2K5/8/8/8/8/8/8/8");
    }

    #[test_case("3.250010001", true)]
    #[test_case("3.300000000", true)]
    #[test_case("0000000001", false)]
    #[test_case("abc", false)]
    fn pi_capable_serials(serial: &str, expected: bool) {
        assert_eq!(long_serial_supports_pi(serial), expected);
    }

    #[test]
    fn serial_numbers_are_ascii() {
        let frame = Frame::new(0x91, b"12345".to_vec());
        assert_eq!(
            Message::parse(&frame),
            Ok(Message::SerialNumber("12345".to_string()))
        );
    }
}
