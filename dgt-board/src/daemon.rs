//! Daemon lifecycle management for dgtd.
//!
//! This module handles the core daemon functionality including initialization,
//! task management, signal handling, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Level;

use crate::config::Config;
use crate::event::{BoardEvent, ConnectText};
use crate::protocol::ClockIcons;
use crate::session::{Board, Session};
use crate::tracing::prelude::*;
use crate::transport::{SerialOpener, TransportManager};

/// How long the connect text stays on the clock.
const ANNOUNCE_DURATION: Duration = Duration::from_millis(1100);

/// Runs one board session until a signal asks it to stop.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let transport = TransportManager::new(&self.config, Arc::new(SerialOpener));
        let (session, board, events) = Session::new(self.config.clone(), transport);

        self.tracker.spawn(session.run(self.shutdown.clone()));
        self.tracker.spawn(log_events(board, events, self.shutdown.clone()));
        self.tracker.close();

        info!("Started.");
        info!(
            "For hardware debugging, set RUST_LOG=dgt_board=trace to see \
             all serial communication"
        );

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

/// Log every event and greet a newly found clock with the connect text.
async fn log_events(board: Board, mut events: mpsc::Receiver<BoardEvent>, shutdown: CancellationToken) {
    let mut connect_text: Option<ConnectText> = None;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match log_level(&event) {
            Level::TRACE => trace!("{}", event),
            Level::DEBUG => debug!("{}", event),
            _ => info!("{}", event),
        }

        match event {
            BoardEvent::BoardConnected { text, .. } => connect_text = Some(text),
            BoardEvent::ClockVersion { main, .. } => {
                if let Some(text) = connect_text.clone() {
                    let board = board.clone();
                    tokio::spawn(async move {
                        if let Err(e) = announce(&board, &text, main).await {
                            warn!("cannot show connect text on clock: {}", e);
                        }
                    });
                }
            }
            _ => {}
        }
    }
    debug!("event logger stopping");
}

/// Serial numbers answer the keep-alive probe every second and the search
/// reports every attempt, so both stay below INFO.
fn log_level(event: &BoardEvent) -> Level {
    match event {
        BoardEvent::NoBoard { .. } | BoardEvent::SerialNumber(_) => Level::TRACE,
        BoardEvent::ClockTime { .. } => Level::DEBUG,
        _ => Level::INFO,
    }
}

/// Show the connect text in the size the clock can display.
async fn announce(board: &Board, text: &ConnectText, main_version: u8) -> crate::error::Result<()> {
    if board.capabilities().pi_clock {
        board.set_text_rev2(&text.large, false).await?;
    } else if main_version == 2 {
        board.set_text_3k(&text.medium, false).await?;
    } else {
        board
            .set_text_xl(&text.small, false, ClockIcons::None, ClockIcons::None)
            .await?;
    }
    tokio::time::sleep(ANNOUNCE_DURATION).await;
    board.end_text().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Button;
    use crate::transport::Channel;
    use test_case::test_case;

    #[test_case(BoardEvent::SerialNumber("12345".into()), Level::TRACE)]
    #[test_case(BoardEvent::NoBoard { text: ConnectText::searching('|') }, Level::TRACE)]
    #[test_case(BoardEvent::ClockTime { left: 1, right: 2, connected: true }, Level::DEBUG)]
    #[test_case(BoardEvent::Battery { percent: 80 }, Level::INFO)]
    #[test_case(BoardEvent::Button(Button::Key(1)), Level::INFO)]
    #[test_case(
        BoardEvent::BoardConnected { text: ConnectText::for_board(Channel::Usb, ""), channel: Channel::Usb },
        Level::INFO
    )]
    fn keep_alive_traffic_stays_quiet(event: BoardEvent, expected: Level) {
        assert_eq!(log_level(&event), expected);
    }
}
