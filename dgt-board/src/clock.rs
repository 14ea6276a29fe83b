//! Clock sub-protocol state.
//!
//! The clock hangs off the board and is reached through it. It acks every
//! command, or rejects it, and otherwise broadcasts both sides' remaining
//! time about once a second. [`ClockState`] tracks what was sent, filters
//! implausible times and remembers the lever, but does no I/O; the session
//! acts on the outcomes.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{Ack, AckKind, Button, ClockCommand, ClockTime, Command, Lever};
use crate::tracing::prelude::*;

/// Stored time before the clock has reported anything. Ten hours cannot be
/// shown by any clock, so every real report is lower.
pub const UNKNOWN_TIME: u32 = 36000;

/// Largest increase of a side's time that is taken for a glitch rather
/// than ignored.
pub const MAX_TIME_JUMP: u32 = 3600;

/// How long a clock command may stay unacknowledged before the watchdog
/// resends it.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// What to do about a clock ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The clock rejected the last command; send it once more.
    Resend(Command),
    /// The clock rejected a command already resent or never recorded.
    Rejected,
    Accepted {
        kind: AckKind,
        version: Option<(u8, u8)>,
        button: Option<Button>,
    },
}

/// A time report that survived the plausibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeUpdate {
    pub left: u32,
    pub right: u32,
    pub connected: bool,
    /// Lever moved since the previous report
    pub lever: Option<Button>,
}

#[derive(Debug)]
pub struct ClockState {
    left: u32,
    right: u32,
    lock: Option<Instant>,
    last_command: Option<Command>,
    lever: Option<Lever>,
    in_set_time: bool,
    serial_clock: bool,
    last_hold: Option<Duration>,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            left: UNKNOWN_TIME,
            right: UNKNOWN_TIME,
            lock: None,
            last_command: None,
            lever: None,
            in_set_time: false,
            serial_clock: false,
            last_hold: None,
        }
    }
}

impl ClockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored (left, right) times in seconds.
    pub fn times(&self) -> (u32, u32) {
        (self.left, self.right)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Whether the clock answered the version handshake.
    pub fn serial_clock(&self) -> bool {
        self.serial_clock
    }

    pub fn in_set_time(&self) -> bool {
        self.in_set_time
    }

    /// Hold time of the most recently released lock.
    pub fn last_hold(&self) -> Option<Duration> {
        self.last_hold
    }

    pub fn last_command(&self) -> Option<&Command> {
        self.last_command.as_ref()
    }

    /// Note a clock command going out: it becomes the resend candidate and
    /// locks the clock until acked.
    pub fn record_sent(&mut self, command: Command) {
        if self.lock.is_some() {
            warn!("clock is already locked, maybe a resend?");
        } else {
            debug!("clock is locked now");
        }
        self.lock = Some(Instant::now());
        self.last_command = Some(command);
    }

    /// Drop the resend candidate after it was resent.
    pub fn forget_last_command(&mut self) {
        self.last_command = None;
    }

    /// Clear the lock, returning how long it was held.
    pub fn release_lock(&mut self) -> Option<Duration> {
        let since = self.lock.take()?;
        let held = since.elapsed();
        debug!("clock unlocked after {:.3} secs", held.as_secs_f64());
        self.last_hold = Some(held);
        Some(held)
    }

    /// Clear a lock held longer than [`LOCK_TIMEOUT`] and hand out the
    /// command to resend, if it was not resent already.
    pub fn take_stale_lock(&mut self) -> Option<Option<Command>> {
        let since = self.lock?;
        if since.elapsed() <= LOCK_TIMEOUT {
            return None;
        }
        warn!("clock is locked over {:?}, resending last command", LOCK_TIMEOUT);
        self.lock = None;
        Some(self.last_command.clone())
    }

    /// Reset for a new version handshake. The caller sends
    /// [`ClockCommand::Version`].
    pub fn begin_handshake(&mut self) -> Command {
        self.lock = None;
        self.serial_clock = false;
        Command::Clock(ClockCommand::Version)
    }

    /// Enter set-time mode: until the next set-and-run, the clock's own
    /// reports are replaced by these times.
    pub fn enter_set_time(&mut self, left: u32, right: u32) {
        self.left = left;
        self.right = right;
        self.in_set_time = true;
    }

    pub fn leave_set_time(&mut self) {
        self.in_set_time = false;
    }

    pub fn handle_ack(&mut self, ack: &Ack) -> AckOutcome {
        if !ack.ok() {
            warn!("clock ACK error {:?}", ack.codes);
            return match self.last_command.take() {
                Some(command) => {
                    debug!("clock resending failed message {:?}", command);
                    AckOutcome::Resend(command)
                }
                None => AckOutcome::Rejected,
            };
        }

        let kind = ack.kind();
        debug!("clock ACK okay {:?}", kind);
        if let Some(last) = self.last_command.as_ref().and_then(Command::as_clock) {
            if ack.is_reply() && ack.codes[1] != last.id() as u8 {
                warn!("clock ACK {:?} out of sync, last: {:?}", kind, last.id());
            }
        }

        let button = ack.button();
        if let Some(button) = button {
            debug!("clock {} pressed, ack2: {}", button, ack.codes[2]);
        }

        let version = ack.version();
        if let Some((main, sub)) = version {
            debug!("clock version {}.{}", main, sub);
            self.serial_clock = true;
        }

        AckOutcome::Accepted {
            kind,
            version,
            button,
        }
    }

    /// Apply a time report.
    ///
    /// The clock counts down, so a side gaining time is suspicious. Such a
    /// report is never announced; it is stored unless in set-time mode or
    /// the jump exceeds [`MAX_TIME_JUMP`].
    pub fn handle_time(&mut self, time: &ClockTime) -> Option<TimeUpdate> {
        if time.left > self.left || time.right > self.right {
            warn!(
                "clock strange old time received l:{} r:{}, stored l:{} r:{}",
                hms(time.left),
                hms(time.right),
                hms(self.left),
                hms(self.right)
            );
            if self.in_set_time {
                debug!("clock still in set mode, ignore received time");
            } else if time.right.saturating_sub(self.right) > MAX_TIME_JUMP
                || time.left.saturating_sub(self.left) > MAX_TIME_JUMP
            {
                debug!("clock new time over 1h difference, ignore received time");
            } else {
                self.left = time.left;
                self.right = time.right;
            }
            return None;
        }

        debug!("clock new time received l:{} r:{}", hms(time.left), hms(time.right));
        let connected = time.connected();
        let mut lever = None;
        let (mut left, mut right) = (time.left, time.right);

        if connected {
            let position = time.lever();
            if self.lever != Some(position) {
                debug!("clock lever status 0x{:02x}, old lever: {:?}", time.status, self.lever);
                if self.lever.is_some() {
                    lever = Some(Button::Lever(position));
                }
                self.lever = Some(position);
            }
        } else {
            debug!("clock not connected, sending old time");
            (left, right) = (self.left, self.right);
        }

        if self.in_set_time {
            debug!("clock still in set mode, sending old time");
            (left, right) = (self.left, self.right);
        }

        self.left = left;
        self.right = right;
        Some(TimeUpdate {
            left,
            right,
            connected,
            lever,
        })
    }
}

/// Format seconds as h:mm:ss for logs.
pub fn hms(seconds: u32) -> String {
    format!("{}:{:02}:{:02}", seconds / 3600, seconds / 60 % 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClockReport, Hms};

    fn time(payload: [u8; 7]) -> ClockTime {
        match ClockReport::parse(payload) {
            ClockReport::Time(t) => t,
            other => panic!("expected time, got {:?}", other),
        }
    }

    fn at(left: u32, right: u32, status: u8) -> ClockTime {
        ClockTime {
            left,
            right,
            status,
        }
    }

    fn ok_ack(kind: u8) -> Ack {
        Ack {
            codes: [0x10, kind, 0, 0],
        }
    }

    fn error_ack() -> Ack {
        Ack {
            codes: [0x00, 0x0c, 0, 0],
        }
    }

    #[test]
    fn first_report_is_accepted_without_lever_event() {
        let mut clock = ClockState::new();
        let update = clock
            .handle_time(&time([0x01, 0x30, 0x00, 0x00, 0x45, 0x30, 0x00]))
            .unwrap();
        assert_eq!(
            update,
            TimeUpdate {
                left: 2730,
                right: 5400,
                connected: true,
                lever: None
            }
        );
        assert_eq!(clock.times(), (2730, 5400));
    }

    #[test]
    fn lever_change_emits_signed_button() {
        let mut clock = ClockState::new();
        clock.handle_time(&at(100, 100, 0x00));
        let update = clock.handle_time(&at(99, 100, 0x02)).unwrap();
        assert_eq!(update.lever, Some(Button::Lever(Lever::RightDown)));
        assert_eq!(update.lever.map(|b| b.code()), Some(-0x40));

        let update = clock.handle_time(&at(99, 99, 0x02)).unwrap();
        assert_eq!(update.lever, None);
    }

    #[test]
    fn disconnected_clock_reports_stored_times() {
        let mut clock = ClockState::new();
        clock.handle_time(&at(300, 200, 0x00));
        let update = clock.handle_time(&at(0, 0, 0x20)).unwrap();
        assert!(!update.connected);
        assert_eq!((update.left, update.right), (300, 200));
        assert_eq!(clock.times(), (300, 200));
    }

    #[test]
    fn jump_over_an_hour_is_ignored() {
        let mut clock = ClockState::new();
        clock.handle_time(&at(600, 600, 0));
        assert_eq!(clock.handle_time(&at(600, 600 + 3601, 0)), None);
        assert_eq!(clock.times(), (600, 600));
    }

    #[test]
    fn small_increase_is_stored_but_not_reported() {
        let mut clock = ClockState::new();
        clock.handle_time(&at(600, 600, 0));
        assert_eq!(clock.handle_time(&at(610, 600, 0)), None);
        assert_eq!(clock.times(), (610, 600));

        // decreasing again is reported normally
        let update = clock.handle_time(&at(609, 600, 0)).unwrap();
        assert_eq!(update.left, 609);
    }

    #[test]
    fn set_time_mode_overrides_reports() {
        let mut clock = ClockState::new();
        clock.enter_set_time(300, 300);

        assert_eq!(clock.handle_time(&at(400, 300, 0)), None);
        assert_eq!(clock.times(), (300, 300));

        let update = clock.handle_time(&at(120, 110, 0)).unwrap();
        assert_eq!((update.left, update.right), (300, 300));

        clock.leave_set_time();
        let update = clock.handle_time(&at(120, 110, 0)).unwrap();
        assert_eq!((update.left, update.right), (120, 110));
    }

    #[tokio::test(start_paused = true)]
    async fn ok_ack_releases_lock_with_hold_time() {
        let mut clock = ClockState::new();
        clock.record_sent(Command::Clock(ClockCommand::End));
        assert!(clock.is_locked());

        tokio::time::advance(Duration::from_millis(250)).await;
        let outcome = clock.handle_ack(&ok_ack(0x03));
        assert!(matches!(outcome, AckOutcome::Accepted { kind: AckKind::End, .. }));

        let held = clock.release_lock().unwrap();
        assert!(held >= Duration::from_millis(250));
        assert!(!clock.is_locked());
        assert_eq!(clock.last_hold(), Some(held));
    }

    #[test]
    fn failed_ack_resends_exactly_once() {
        let mut clock = ClockState::new();
        let command = Command::Clock(ClockCommand::text_3k("hello", false));
        clock.record_sent(command.clone());

        assert_eq!(clock.handle_ack(&error_ack()), AckOutcome::Resend(command.clone()));

        // the session resends, which records the command again, then forgets it
        clock.record_sent(command);
        clock.forget_last_command();
        assert_eq!(clock.handle_ack(&error_ack()), AckOutcome::Rejected);
        assert!(clock.is_locked());
    }

    #[test]
    fn version_ack_enables_serial_clock() {
        let mut clock = ClockState::new();
        let command = clock.begin_handshake();
        assert_eq!(command, Command::Clock(ClockCommand::Version));
        clock.record_sent(command);
        assert!(!clock.serial_clock());

        let ack = Ack {
            codes: [0x10, 0x09, 0x21, 0],
        };
        assert_eq!(
            clock.handle_ack(&ack),
            AckOutcome::Accepted {
                kind: AckKind::Version,
                version: Some((2, 1)),
                button: None
            }
        );
        assert!(clock.serial_clock());
    }

    #[test]
    fn button_ack_is_decoded() {
        let mut clock = ClockState::new();
        let ack = Ack {
            codes: [0x10, 0x88, 69, 53],
        };
        assert!(matches!(
            clock.handle_ack(&ack),
            AckOutcome::Accepted {
                button: Some(Button::Combo),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_is_taken_once() {
        let mut clock = ClockState::new();
        let command = Command::Clock(ClockCommand::set_and_run(
            true,
            Hms::new(0, 5, 0),
            false,
            Hms::new(0, 5, 0),
        ));
        clock.record_sent(command.clone());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.take_stale_lock(), None);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(clock.take_stale_lock(), Some(Some(command)));
        assert!(!clock.is_locked());
        assert_eq!(clock.take_stale_lock(), None);
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(hms(5400), "1:30:00");
        assert_eq!(hms(59), "0:00:59");
    }
}
