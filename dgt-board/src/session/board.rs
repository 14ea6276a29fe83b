//! Command surface for the board and its clock.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{ClockCommand, ClockIcons, Command, Hms, Square};
use crate::tracing::prelude::*;

use super::Shared;

/// What the connected hardware turned out to support.
///
/// Reset on every reconnect and filled in from the board's replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// A Revelation II with square LEDs
    pub revelation: bool,
    /// The Revelation II firmware runs a co-located clock
    pub pi_clock: bool,
}

/// Handle for commanding the board.
///
/// Clones share the same session. Clock commands wait until the previous
/// one was acked; every command fails with [`Error::Disconnected`] while no
/// board is attached.
#[derive(Clone)]
pub struct Board {
    pub(super) shared: Arc<Shared>,
}

impl Board {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Show text on a DGT3000.
    pub async fn set_text_3k(&self, text: &str, beep: bool) -> Result<()> {
        self.clock_command(ClockCommand::text_3k(text, beep)).await
    }

    /// Show text on a Revelation II in Pi mode.
    pub async fn set_text_rev2(&self, text: &str, beep: bool) -> Result<()> {
        self.clock_command(ClockCommand::text_rev2(text, beep)).await
    }

    /// Show text on a DGT XL.
    pub async fn set_text_xl(
        &self,
        text: &str,
        beep: bool,
        left_icons: ClockIcons,
        right_icons: ClockIcons,
    ) -> Result<()> {
        self.clock_command(ClockCommand::text_xl(text, beep, left_icons, right_icons))
            .await
    }

    /// Set both sides and start the one running alone. Leaves set-time mode.
    pub async fn set_and_run(
        &self,
        left_running: bool,
        left: Hms,
        right_running: bool,
        right: Hms,
    ) -> Result<()> {
        self.shared.state.lock().clock.leave_set_time();
        self.clock_command(ClockCommand::set_and_run(left_running, left, right_running, right))
            .await
    }

    /// Return the clock from text to time display.
    pub async fn end_text(&self) -> Result<()> {
        self.clock_command(ClockCommand::End).await
    }

    /// Enter set-time mode with these times, in seconds. Until the next
    /// [`set_and_run`](Self::set_and_run) the clock's own reports are
    /// replaced by them.
    pub fn set_clock(&self, left: u32, right: u32) {
        debug!("clock set to l:{} r:{}", left, right);
        self.shared.state.lock().clock.enter_set_time(left, right);
    }

    /// Light the from and to squares of a UCI move.
    pub async fn light_squares(&self, uci: &str) -> Result<()> {
        let (from, to) =
            Square::parse_move(uci).ok_or_else(|| Error::InvalidSquare(uci.to_string()))?;
        self.leds(|reversed| Command::leds_on(from, to, reversed)).await
    }

    pub async fn light_square(&self, square: &str) -> Result<()> {
        let square = Square::parse(square).ok_or_else(|| Error::InvalidSquare(square.to_string()))?;
        self.leds(|reversed| Command::leds_on(square, square, reversed)).await
    }

    pub async fn clear_lights(&self) -> Result<()> {
        self.leds(|_| Command::leds_off()).await
    }

    pub async fn ask_battery_status(&self) -> Result<()> {
        self.shared.write_command(Command::SendBatteryStatus).await
    }

    /// Flag little remaining time, which shortens the field debounce.
    pub fn set_low_time(&self, low_time: bool) {
        self.shared.state.lock().low_time = low_time;
    }

    /// The board is turned around; LED indices are mirrored.
    pub fn set_reversed(&self, reversed: bool) {
        self.shared.state.lock().reversed = reversed;
    }

    /// Last known (left, right) clock times in seconds.
    pub fn clock_times(&self) -> (u32, u32) {
        self.shared.state.lock().clock.times()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.shared.state.lock().caps
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.is_connected().await
    }

    async fn clock_command(&self, command: ClockCommand) -> Result<()> {
        let what = format!("{:?}", command.id());
        self.shared.wait_for_clock(&what).await;
        self.shared.write_command(command.into()).await
    }

    /// Send an LED command if the board has LEDs and they are enabled.
    /// Otherwise do nothing.
    async fn leds(&self, command: impl FnOnce(bool) -> Command) -> Result<()> {
        let (enabled, reversed) = {
            let state = self.shared.state.lock();
            (
                state.caps.revelation && !self.shared.config.disable_revelation_leds,
                state.reversed,
            )
        };
        if !enabled {
            trace!("square leds not available");
            return Ok(());
        }
        self.shared.write_command(command(reversed)).await
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}
