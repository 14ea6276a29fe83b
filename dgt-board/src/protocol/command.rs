//! Host-to-board commands.
//!
//! Every command is a command byte, optionally followed by arguments. Clock
//! commands are tunnelled through [`CommandId::ClockMessage`]:
//!
//! ```text
//! 2b <len> 03 <clock id> <args...> 00
//! ```
//!
//! where `len` counts the bytes that follow it.

use std::fmt;

use thiserror::Error;

/// Board command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    ClockMessage = 0x2b,
    SendBoard = 0x42,
    ReturnSerialNumber = 0x45,
    UpdateNice = 0x4b,
    BatteryStatus = 0x4c,
    SendVersion = 0x4d,
    ReturnLongSerialNumber = 0x55,
    SetLeds = 0x60,
}

impl TryFrom<u8> for CommandId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x2b => Ok(Self::ClockMessage),
            0x42 => Ok(Self::SendBoard),
            0x45 => Ok(Self::ReturnSerialNumber),
            0x4b => Ok(Self::UpdateNice),
            0x4c => Ok(Self::BatteryStatus),
            0x4d => Ok(Self::SendVersion),
            0x55 => Ok(Self::ReturnLongSerialNumber),
            0x60 => Ok(Self::SetLeds),
            _ => Err(value),
        }
    }
}

/// Clock sub-command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClockCommandId {
    Display = 0x01,
    End = 0x03,
    Version = 0x09,
    SetAndRun = 0x0a,
    Ascii = 0x0c,
    Rev2Ascii = 0x0d,
}

impl TryFrom<u8> for ClockCommandId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Display),
            0x03 => Ok(Self::End),
            0x09 => Ok(Self::Version),
            0x0a => Ok(Self::SetAndRun),
            0x0c => Ok(Self::Ascii),
            0x0d => Ok(Self::Rev2Ascii),
            _ => Err(value),
        }
    }
}

/// Marker opening a tunnelled clock command.
pub const CLOCK_START: u8 = 0x03;

/// Marker closing a tunnelled clock command.
pub const CLOCK_END: u8 = 0x00;

/// LED index meaning "no square", used to switch the LEDs off.
pub const LED_NONE: u8 = 0x40;

/// Text length of the DGT3000 display.
pub const TEXT_3K_LEN: usize = 8;

/// Text length of the Revelation II display in Pi mode.
pub const TEXT_REV2_LEN: usize = 11;

/// Digit count of the DGT XL display.
pub const TEXT_XL_LEN: usize = 6;

/// A command could not be put on the wire.
///
/// Only the command is dropped; the transport stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("byte 0x{byte:02x} at offset {offset} cannot be sent to the board")]
    HighBit { byte: u8, offset: usize },
}

/// Which side of the clock runs after a set-and-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClockSide {
    Left = 0x01,
    Right = 0x02,
    None = 0x04,
}

/// Dot or colon shown between the digits of one side of an XL display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockIcons {
    #[default]
    None,
    Dot,
    Colon,
}

impl ClockIcons {
    fn bits(self) -> u8 {
        match self {
            ClockIcons::None => 0x00,
            ClockIcons::Dot => 0x01,
            ClockIcons::Colon => 0x02,
        }
    }
}

/// Hours, minutes and seconds of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hms {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl Hms {
    pub fn new(hours: u8, minutes: u8, seconds: u8) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    /// Split a number of seconds, clamping to what a clock can show.
    pub fn from_seconds(total: u32) -> Self {
        let total = total.min(9 * 3600 + 59 * 60 + 59);
        Self {
            hours: (total / 3600) as u8,
            minutes: (total / 60 % 60) as u8,
            seconds: (total % 60) as u8,
        }
    }

    pub fn as_seconds(&self) -> u32 {
        self.hours as u32 * 3600 + self.minutes as u32 * 60 + self.seconds as u32
    }
}

impl fmt::Display for Hms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}:{:02}", self.hours, self.minutes, self.seconds)
    }
}

/// Command for the clock, sent through the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockCommand {
    /// Ask for the clock version; the reply is the handshake ack.
    Version,
    /// Text on a DGT3000.
    Ascii { text: [u8; TEXT_3K_LEN], beep: bool },
    /// Text on a Revelation II in Pi mode.
    Rev2Ascii { text: [u8; TEXT_REV2_LEN], beep: bool },
    /// Segment glyphs on a DGT XL, already in wire order.
    Display {
        glyphs: [u8; TEXT_XL_LEN],
        left_icons: ClockIcons,
        right_icons: ClockIcons,
        beep: bool,
    },
    /// Set both sides and start one of them.
    SetAndRun { left: Hms, right: Hms, side: ClockSide },
    /// Return from text to time display.
    End,
}

impl ClockCommand {
    /// DGT3000 text, space padded or truncated to eight bytes.
    pub fn text_3k(text: &str, beep: bool) -> Self {
        ClockCommand::Ascii {
            text: pad(text),
            beep,
        }
    }

    /// Revelation II text, space padded or truncated to eleven bytes.
    pub fn text_rev2(text: &str, beep: bool) -> Self {
        ClockCommand::Rev2Ascii {
            text: pad(text),
            beep,
        }
    }

    /// DGT XL text through the segment glyph table.
    ///
    /// The XL addresses its digits right to left within each half, so the
    /// six characters go out as 2, 1, 0, 5, 4, 3.
    pub fn text_xl(text: &str, beep: bool, left_icons: ClockIcons, right_icons: ClockIcons) -> Self {
        let chars: [u8; TEXT_XL_LEN] = pad(text);
        let g = chars.map(|c| glyph(c as char));
        ClockCommand::Display {
            glyphs: [g[2], g[1], g[0], g[5], g[4], g[3]],
            left_icons,
            right_icons,
            beep,
        }
    }

    /// Set both sides; only a side running alone is started.
    pub fn set_and_run(left_running: bool, left: Hms, right_running: bool, right: Hms) -> Self {
        let side = match (left_running, right_running) {
            (true, false) => ClockSide::Left,
            (false, true) => ClockSide::Right,
            _ => ClockSide::None,
        };
        ClockCommand::SetAndRun { left, right, side }
    }

    pub fn id(&self) -> ClockCommandId {
        match self {
            ClockCommand::Version => ClockCommandId::Version,
            ClockCommand::Ascii { .. } => ClockCommandId::Ascii,
            ClockCommand::Rev2Ascii { .. } => ClockCommandId::Rev2Ascii,
            ClockCommand::Display { .. } => ClockCommandId::Display,
            ClockCommand::SetAndRun { .. } => ClockCommandId::SetAndRun,
            ClockCommand::End => ClockCommandId::End,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            ClockCommand::Version | ClockCommand::End => Vec::new(),
            ClockCommand::Ascii { text, beep } => {
                let mut body = text.to_vec();
                body.push(*beep as u8);
                body
            }
            ClockCommand::Rev2Ascii { text, beep } => {
                let mut body = text.to_vec();
                body.push(*beep as u8);
                body
            }
            ClockCommand::Display {
                glyphs,
                left_icons,
                right_icons,
                beep,
            } => {
                let icons = (right_icons.bits() & 0x07) | ((left_icons.bits() << 3) & 0x38);
                let mut body = glyphs.to_vec();
                body.push(icons);
                body.push(*beep as u8);
                body
            }
            ClockCommand::SetAndRun { left, right, side } => vec![
                left.hours,
                left.minutes,
                left.seconds,
                right.hours,
                right.minutes,
                right.seconds,
                *side as u8,
            ],
        }
    }
}

/// A square on the board, file and rank counted from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    pub file: u8,
    pub rank: u8,
}

impl Square {
    /// Parse algebraic notation such as `e2`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let file = chars.next()?;
        let rank = chars.next()?;
        if !('a'..='h').contains(&file) || !('1'..='8').contains(&rank) {
            return None;
        }
        Some(Self {
            file: file as u8 - b'a',
            rank: rank as u8 - b'1',
        })
    }

    /// Parse the from and to squares of a UCI move such as `e2e4` or `e7e8q`.
    pub fn parse_move(uci: &str) -> Option<(Self, Self)> {
        let from = Self::parse(uci.get(0..2)?)?;
        let to = Self::parse(uci.get(2..4)?)?;
        Some((from, to))
    }

    /// LED index: a8 is 0, h1 is 63. A reversed board mirrors the index.
    pub fn led_index(&self, reversed: bool) -> u8 {
        let index = (7 - self.rank) * 8 + self.file;
        if reversed { 63 - index } else { index }
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'a' + self.file) as char, self.rank + 1)
    }
}

/// A host-to-board command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendBoard,
    SendUpdateNice,
    SendVersion,
    ReturnSerialNumber,
    ReturnLongSerialNumber,
    SendBatteryStatus,
    /// Revelation II square LEDs. `from == to` lights a single square.
    SetLeds { on: bool, from: u8, to: u8 },
    Clock(ClockCommand),
}

impl Command {
    pub fn leds_on(from: Square, to: Square, reversed: bool) -> Self {
        Command::SetLeds {
            on: true,
            from: from.led_index(reversed),
            to: to.led_index(reversed),
        }
    }

    pub fn leds_off() -> Self {
        Command::SetLeds {
            on: false,
            from: LED_NONE,
            to: LED_NONE,
        }
    }

    pub fn id(&self) -> CommandId {
        match self {
            Command::SendBoard => CommandId::SendBoard,
            Command::SendUpdateNice => CommandId::UpdateNice,
            Command::SendVersion => CommandId::SendVersion,
            Command::ReturnSerialNumber => CommandId::ReturnSerialNumber,
            Command::ReturnLongSerialNumber => CommandId::ReturnLongSerialNumber,
            Command::SendBatteryStatus => CommandId::BatteryStatus,
            Command::SetLeds { .. } => CommandId::SetLeds,
            Command::Clock(_) => CommandId::ClockMessage,
        }
    }

    pub fn as_clock(&self) -> Option<&ClockCommand> {
        match self {
            Command::Clock(clock) => Some(clock),
            _ => None,
        }
    }

    /// Wire bytes of this command.
    ///
    /// Fails if any byte would carry the high bit, which the board reserves
    /// for its own frame starts.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = vec![self.id() as u8];
        match self {
            Command::SetLeds { on, from, to } => {
                bytes.extend_from_slice(&[0x04, *on as u8, *from, *to, CLOCK_END]);
            }
            Command::Clock(clock) => {
                let body = clock.body();
                bytes.push((body.len() + 3) as u8);
                bytes.push(CLOCK_START);
                bytes.push(clock.id() as u8);
                bytes.extend_from_slice(&body);
                bytes.push(CLOCK_END);
            }
            _ => {}
        }

        if let Some((offset, &byte)) = bytes.iter().enumerate().find(|(_, b)| **b >= 0x80) {
            return Err(EncodeError::HighBit { byte, offset });
        }
        Ok(bytes)
    }
}

impl From<ClockCommand> for Command {
    fn from(clock: ClockCommand) -> Self {
        Command::Clock(clock)
    }
}

fn pad<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (slot, byte) in out.iter_mut().zip(text.bytes()) {
        *slot = byte;
    }
    out
}

/// Seven-segment glyph of a character on the DGT XL; unknown characters are
/// blank.
pub fn glyph(c: char) -> u8 {
    match c.to_ascii_lowercase() {
        '0' => 0x3f,
        '1' => 0x06,
        '2' => 0x5b,
        '3' => 0x4f,
        '4' => 0x66,
        '5' => 0x6d,
        '6' => 0x7d,
        '7' => 0x07,
        '8' => 0x7f,
        '9' => 0x6f,
        'a' => 0x5f,
        'b' => 0x7c,
        'c' => 0x58,
        'd' => 0x5e,
        'e' => 0x7b,
        'f' => 0x71,
        'g' => 0x3d,
        'h' => 0x74,
        'i' => 0x10,
        'j' => 0x1e,
        'k' => 0x75,
        'l' => 0x38,
        'm' => 0x55,
        'n' => 0x54,
        'o' => 0x5c,
        'p' => 0x73,
        'q' => 0x67,
        'r' => 0x50,
        's' => 0x6d,
        't' => 0x78,
        'u' => 0x3e,
        'v' => 0x2a,
        'w' => 0x7e,
        'x' => 0x64,
        'y' => 0x6e,
        'z' => 0x5b,
        '-' => 0x40,
        '/' => 0x52,
        '|' => 0x36,
        '\\' => 0x64,
        '?' => 0x53,
        '@' => 0x65,
        '=' => 0x48,
        '_' => 0x08,
        _ => 0x00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Command::SendBoard, &[0x42])]
    #[test_case(Command::SendUpdateNice, &[0x4b])]
    #[test_case(Command::SendVersion, &[0x4d])]
    #[test_case(Command::ReturnSerialNumber, &[0x45])]
    #[test_case(Command::ReturnLongSerialNumber, &[0x55])]
    #[test_case(Command::SendBatteryStatus, &[0x4c])]
    fn single_byte_commands(command: Command, expected: &[u8]) {
        assert_eq!(command.encode().unwrap(), expected);
    }

    #[test]
    fn led_indices_for_a_move() {
        let (from, to) = Square::parse_move("e2e4").unwrap();
        assert_eq!(from.led_index(false), 52);
        assert_eq!(to.led_index(false), 36);
        assert_eq!(
            Command::leds_on(from, to, false).encode().unwrap(),
            vec![0x60, 0x04, 0x01, 52, 36, 0x00]
        );
    }

    #[test_case("a8", false, 0)]
    #[test_case("h1", false, 63)]
    #[test_case("a1", false, 56)]
    #[test_case("a8", true, 63)]
    #[test_case("e2", true, 11)]
    fn led_index(square: &str, reversed: bool, expected: u8) {
        assert_eq!(Square::parse(square).unwrap().led_index(reversed), expected);
    }

    #[test]
    fn leds_off_uses_the_none_index() {
        assert_eq!(
            Command::leds_off().encode().unwrap(),
            vec![0x60, 0x04, 0x00, 0x40, 0x40, 0x00]
        );
    }

    #[test]
    fn rejects_bad_squares() {
        assert_eq!(Square::parse("i1"), None);
        assert_eq!(Square::parse("a9"), None);
        assert_eq!(Square::parse("a"), None);
        assert_eq!(Square::parse_move("e2"), None);
        assert_eq!(Square::parse_move("e7e8q").map(|(_, to)| to.to_string()), Some("e8".into()));
    }

    #[test]
    fn clock_version_handshake() {
        let cmd = Command::Clock(ClockCommand::Version);
        assert_eq!(cmd.encode().unwrap(), vec![0x2b, 0x03, 0x03, 0x09, 0x00]);
    }

    #[test]
    fn clock_end_text() {
        let cmd = Command::Clock(ClockCommand::End);
        assert_eq!(cmd.encode().unwrap(), vec![0x2b, 0x03, 0x03, 0x03, 0x00]);
    }

    #[test]
    fn text_3k_is_padded_with_spaces() {
        let cmd = Command::Clock(ClockCommand::text_3k("ok usb", true));
        let bytes = cmd.encode().unwrap();
        assert_eq!(&bytes[..4], &[0x2b, 0x0c, 0x03, 0x0c]);
        assert_eq!(&bytes[4..12], b"ok usb  ");
        assert_eq!(&bytes[12..], &[0x01, 0x00]);
    }

    #[test]
    fn text_rev2_is_truncated() {
        let cmd = Command::Clock(ClockCommand::text_rev2("USB e-Board too long", false));
        let bytes = cmd.encode().unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..4], &[0x2b, 0x0f, 0x03, 0x0d]);
        assert_eq!(&bytes[4..15], b"USB e-Board");
        assert_eq!(&bytes[15..], &[0x00, 0x00]);
    }

    #[test]
    fn text_xl_uses_glyphs_in_digit_order() {
        let cmd = ClockCommand::text_xl("ok usb", false, ClockIcons::Colon, ClockIcons::Dot);
        let bytes = Command::from(cmd).encode().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x2b, 0x0b, 0x03, 0x01,
                // " ", "k", "o"
                0x00, 0x75, 0x5c,
                // "b", "s", "u"
                0x7c, 0x6d, 0x3e,
                // right dot, left colon
                0x11,
                0x00, 0x00,
            ]
        );
    }

    #[test_case('A', 0x5f; "uppercase_is_lowered")]
    #[test_case('0', 0x3f; "digit")]
    #[test_case('\\', 0x64; "backslash")]
    #[test_case('#', 0x00; "unknown_is_blank")]
    fn glyphs(c: char, expected: u8) {
        assert_eq!(glyph(c), expected);
    }

    #[test_case(true, false, ClockSide::Left)]
    #[test_case(false, true, ClockSide::Right)]
    #[test_case(true, true, ClockSide::None)]
    #[test_case(false, false, ClockSide::None)]
    fn set_and_run_side(left: bool, right: bool, expected: ClockSide) {
        let cmd = ClockCommand::set_and_run(left, Hms::new(0, 5, 0), right, Hms::new(1, 2, 3));
        let bytes = Command::from(cmd).encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x2b, 0x0a, 0x03, 0x0a, 0, 5, 0, 1, 2, 3, expected as u8, 0x00]
        );
    }

    #[test]
    fn non_ascii_text_fails_without_side_effects() {
        let cmd = Command::Clock(ClockCommand::text_3k("größe", false));
        assert!(matches!(cmd.encode(), Err(EncodeError::HighBit { offset: 6, .. })));
    }

    #[test]
    fn hms_conversions() {
        assert_eq!(Hms::from_seconds(5430), Hms::new(1, 30, 30));
        assert_eq!(Hms::new(0, 45, 30).as_seconds(), 2730);
        assert_eq!(Hms::from_seconds(36000), Hms::new(9, 59, 59));
        assert_eq!(Hms::new(1, 2, 3).to_string(), "1:02:03");
    }
}
