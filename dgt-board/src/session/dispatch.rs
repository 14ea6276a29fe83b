//! Message dispatch for the reader task.

use crate::debounce::settle_delay;
use crate::event::{BoardEvent, ConnectText};
use crate::protocol::message::long_serial_supports_pi;
use crate::protocol::{Command, Frame, Message, MessageId};
use crate::protocol::{BoardDump, ClockReport};
use crate::clock::AckOutcome;
use crate::tracing::prelude::*;
use crate::transport::Channel;

use super::Session;

impl Session {
    pub(super) async fn dispatch(&mut self, frame: Frame) {
        if let Ok(id) = MessageId::try_from(frame.id) {
            if let Some(expected) = Message::expected_len(id) {
                if frame.payload.len() != expected {
                    warn!(
                        "illegal length in data for {:?}: {} instead of {}",
                        id,
                        frame.payload.len(),
                        expected
                    );
                }
            }
        }

        let message = match Message::parse(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match message {
            Message::Version { major, minor } => self.on_version(major, minor).await,
            Message::Clock(report) => self.on_clock(report).await,
            Message::BoardDump(dump) => self.on_board_dump(dump).await,
            Message::FieldUpdate { .. } => self.on_field_update().await,
            Message::SerialNumber(serial) => {
                self.shared.emit(BoardEvent::SerialNumber(serial)).await;
            }
            Message::LongSerialNumber(serial) => {
                let pi = long_serial_supports_pi(&serial);
                self.shared.state.lock().caps.pi_clock = pi;
                debug!(
                    "clock in PiMode: {}, serial: {}",
                    if pi { "yes" } else { "no" },
                    serial
                );
            }
            Message::BatteryStatus { percent } => {
                self.shared.emit(BoardEvent::Battery { percent }).await;
            }
            Message::Unhandled(id) => warn!("message not handled [{:?}]", id),
            Message::Unknown { id } => warn!("unknown message 0x{:02x}", id),
        }
    }

    async fn on_version(&mut self, major: u8, minor: u8) {
        debug!("board version {}.{}", major, minor);
        // the first board dump gives the consumer a position
        let _ = self.shared.write_command(Command::SendBoard).await;

        let (channel, bt_name) = {
            let state = self.shared.state.lock();
            (state.channel, state.bt_name.clone())
        };
        let text = ConnectText::for_board(channel, &bt_name);

        if channel == Channel::Bluetooth {
            if bt_name.contains("REVII") {
                self.shared.state.lock().caps.revelation = true;
                let _ = self
                    .shared
                    .write_command(Command::ReturnLongSerialNumber)
                    .await;
            }
            let _ = self.shared.write_command(Command::SendBatteryStatus).await;
        }

        self.shared.state.lock().connect_text = Some(text.clone());
        self.shared
            .emit(BoardEvent::BoardConnected { text, channel })
            .await;

        self.shared.startup_serial_clock().await;
        if !self.watchdog.is_running() {
            self.start_watchdog();
        }
    }

    async fn on_clock(&mut self, report: ClockReport) {
        match report {
            ClockReport::Ack(ack) => {
                let outcome = self.shared.state.lock().clock.handle_ack(&ack);
                match outcome {
                    AckOutcome::Resend(command) => {
                        // the lock stays until the resend is acked
                        self.shared.resend_clock(command).await;
                        return;
                    }
                    AckOutcome::Rejected => return,
                    AckOutcome::Accepted {
                        version, button, ..
                    } => {
                        if let Some(button) = button {
                            self.shared.emit(BoardEvent::Button(button)).await;
                        }
                        if let Some((main, sub)) = version {
                            self.shared
                                .emit(BoardEvent::ClockVersion { main, sub })
                                .await;
                        }
                    }
                }
            }
            ClockReport::Time(time) => {
                let update = self.shared.state.lock().clock.handle_time(&time);
                if let Some(update) = update {
                    if let Some(lever) = update.lever {
                        self.shared.emit(BoardEvent::Button(lever)).await;
                    }
                    self.shared
                        .emit(BoardEvent::ClockTime {
                            left: update.left,
                            right: update.right,
                            connected: update.connected,
                        })
                        .await;

                    let serial_clock = self.shared.state.lock().clock.serial_clock();
                    if !serial_clock {
                        if self.watchdog.is_running() {
                            debug!("clock restarting setup");
                            self.shared.startup_serial_clock().await;
                        } else {
                            debug!("clock sends messages already but board still not found");
                        }
                    }
                }
            }
            ClockReport::Illegal(raw) => warn!("clock illegal new time received {:02x?}", raw),
            ClockReport::Null => debug!("clock null message ignored"),
        }

        self.shared.state.lock().clock.release_lock();
    }

    async fn on_board_dump(&mut self, dump: BoardDump) {
        debug!("board dump\n{}", dump);
        let fen = dump.fen();
        debug!("raw fen [{}]", fen);
        self.shared.emit(BoardEvent::RawBoard { fen }).await;
    }

    async fn on_field_update(&mut self) {
        let delay = {
            let state = self.shared.state.lock();
            settle_delay(state.channel, self.shared.config.field_factor, state.low_time)
        };
        let shared = self.shared.clone();
        self.debouncer
            .restart(delay, async move {
                if let Err(e) = shared.write_command(Command::SendBoard).await {
                    debug!("board request after field update failed: {}", e);
                }
            })
            .await;
    }
}
