//! Events delivered to the consumer of the board session.
//!
//! Events arrive in the order the board produced them, once each. Nothing is
//! replayed after a reconnect.

use std::fmt;

use crate::protocol::Button;
use crate::transport::Channel;

/// Text announcing the board, in the sizes the various displays can show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectText {
    pub web: String,
    pub large: String,
    pub medium: String,
    pub small: String,
}

impl ConnectText {
    /// Text for a freshly connected board.
    ///
    /// Bluetooth boards are told apart by their advertised name; its last
    /// five characters are the board's serial suffix.
    pub fn for_board(channel: Channel, bt_name: &str) -> Self {
        let suffix = tail(bt_name, 5);
        let (large, medium, small) = match channel {
            Channel::Usb => ("USB e-Board".into(), "USBboard".into(), "ok usb".into()),
            Channel::Bluetooth if bt_name.contains("REVII") => (
                format!("RevII {}", suffix),
                format!("Rev{}", suffix),
                format!("b{}", suffix),
            ),
            Channel::Bluetooth if bt_name.contains("DGT_BT") => (
                format!("DGTBT {}", suffix),
                format!("BT {}", suffix),
                format!("b{}", suffix),
            ),
            Channel::Bluetooth => ("BT e-Board".into(), "BT board".into(), "ok bt".into()),
        };
        Self {
            web: large.clone(),
            large,
            medium,
            small,
        }
    }

    /// Animated "searching" text, one frame per discovery attempt.
    pub fn searching(spinner: char) -> Self {
        Self {
            web: format!("no DGT e-Board{}", spinner),
            large: format!("DGT eBoard{}", spinner),
            medium: format!("DGT{}", spinner),
            small: spinner.to_string(),
        }
    }
}

fn tail(s: &str, n: usize) -> &str {
    let start = s
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    &s[start..]
}

/// Something the board or clock reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    /// Piece placement, rank 8 first, not flipped for orientation
    RawBoard { fen: String },
    ClockTime {
        left: u32,
        right: u32,
        connected: bool,
    },
    ClockVersion { main: u8, sub: u8 },
    Button(Button),
    Battery { percent: u8 },
    SerialNumber(String),
    BoardConnected { text: ConnectText, channel: Channel },
    NoBoard { text: ConnectText },
}

impl fmt::Display for BoardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardEvent::RawBoard { fen } => write!(f, "raw board {}", fen),
            BoardEvent::ClockTime {
                left,
                right,
                connected,
            } => write!(
                f,
                "clock time l:{} r:{}{}",
                crate::clock::hms(*left),
                crate::clock::hms(*right),
                if *connected { "" } else { " (disconnected)" }
            ),
            BoardEvent::ClockVersion { main, sub } => write!(f, "clock version {}.{}", main, sub),
            BoardEvent::Button(button) => write!(f, "{} ({})", button, button.code()),
            BoardEvent::Battery { percent } => write!(f, "battery {}%", percent),
            BoardEvent::SerialNumber(serial) => write!(f, "serial number {}", serial),
            BoardEvent::BoardConnected { text, channel } => {
                write!(f, "board connected via {}: {}", channel, text.large)
            }
            BoardEvent::NoBoard { text } => write!(f, "{}", text.web),
        }
    }
}
