//! Driver for DGT electronic chessboards and their attached clocks.
//!
//! The board speaks a small binary protocol over a serial line, either a
//! USB CDC port or a Bluetooth RFCOMM tunnel. This crate discovers the
//! board, keeps the session alive across unreliable transports, turns
//! wire messages into [`event::BoardEvent`]s and turns clock/LED requests
//! from [`session::Board`] back into wire bytes.

pub mod clock;
pub mod config;
pub mod daemon;
pub mod debounce;
pub mod error;
pub mod event;
pub mod protocol;
pub mod session;
pub mod tracing;
pub mod transport;
pub mod watchdog;
