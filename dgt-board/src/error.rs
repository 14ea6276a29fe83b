//! Crate-level error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::{EncodeError, ProtocolError};
use crate::transport::bluetooth::PairingError;

/// Errors surfaced by the board driver.
///
/// None of these are fatal to a running session; the reader task maps
/// every one of them onto "no board connected, keep searching".
#[derive(Error, Debug)]
pub enum Error {
    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unexpected protocol data
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A command could not be encoded; nothing was written
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Not a square or move in algebraic notation
    #[error("Invalid square: {0:?}")]
    InvalidSquare(String),

    /// No transport is currently open
    #[error("Board not connected")]
    Disconnected,

    /// Bluetooth pairing failure
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),
}

/// Convenient Result type for board operations.
pub type Result<T> = std::result::Result<T, Error>;
