//! Driver configuration.
//!
//! Built once at startup from `DGT_*` environment variables and shared by
//! reference with every component. There is no other global state.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var}: expected an integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// How to get rid of the bulk EE_MOVES transfer some boards start after a
/// stray request.
///
/// The header of that transfer arrives with an out-of-range length. Instead
/// of resynchronizing byte by byte, the reader discards `length` bytes and
/// gives up after `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Message id announcing the transfer
    pub message_id: u8,
    /// Payload length announced by the header
    pub length: usize,
    /// Longest time spent discarding before resuming normal framing
    pub ceiling: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            message_id: 0x8f,
            length: 0x1f00,
            ceiling: Duration::from_secs(15),
        }
    }
}

/// Board driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Explicit device path. When set, autodetection is skipped.
    pub device: Option<String>,

    /// Sliding tolerance for the field debouncer, 0 to 9.
    pub field_factor: u8,

    /// Never drive the Revelation II square LEDs.
    pub disable_revelation_leds: bool,

    /// The clock is driven by a co-located controller, so the watchdog must
    /// not resend locked clock commands.
    pub pi_mode: bool,

    /// Fall back to Bluetooth pairing when no local port answers.
    pub bluetooth: bool,

    /// EE_MOVES drain handling.
    pub drain: DrainPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            field_factor: 0,
            disable_revelation_leds: false,
            pi_mode: false,
            bluetooth: true,
            drain: DrainPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(device) = lookup("DGT_DEVICE").filter(|d| !d.trim().is_empty()) {
            config.device = Some(device.trim().to_string());
        }

        if let Some(value) = lookup("DGT_FIELD_FACTOR") {
            let factor = value
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "DGT_FIELD_FACTOR",
                    value: value.clone(),
                })?;
            config.field_factor = (factor % 10) as u8;
        }

        if let Some(value) = lookup("DGT_DISABLE_REVELATION_LEDS") {
            config.disable_revelation_leds = parse_bool("DGT_DISABLE_REVELATION_LEDS", &value)?;
        }
        if let Some(value) = lookup("DGT_PI_MODE") {
            config.pi_mode = parse_bool("DGT_PI_MODE", &value)?;
        }
        if let Some(value) = lookup("DGT_BLUETOOTH") {
            config.bluetooth = parse_bool("DGT_BLUETOOTH", &value)?;
        }

        Ok(config)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}
