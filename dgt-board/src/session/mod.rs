//! The live session with one board.
//!
//! A [`Session`] is the reader task: it discovers the board, pulls bytes
//! through the [`FrameCodec`], dispatches messages and tears the link down
//! on any I/O error so the next iteration rediscovers. Discovery and
//! reading therefore never overlap.
//!
//! A [`Board`] is a cheap handle for everyone else. Board handles, the
//! watchdog and the field debouncer all write through one exclusive write
//! path in [`Shared`], held only for the write itself.

mod board;
mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;

pub use board::{Board, Capabilities};

use crate::clock::ClockState;
use crate::config::Config;
use crate::debounce::FieldDebouncer;
use crate::error::{Error, Result};
use crate::event::{BoardEvent, ConnectText};
use crate::protocol::{Command, FrameCodec, Inbound};
use crate::tracing::prelude::*;
use crate::transport::{BoxPort, Channel, Discovery, TransportManager};
use crate::watchdog::{WATCHDOG_PERIOD, Watchdog};

/// Longest wait for a byte before the reader counts an idle tick.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Every this many idle ticks without a watchdog, probe the board inline.
const IDLE_PROBE_TICKS: u32 = 10;

/// Pause between opening the port and talking to the board.
const STARTUP_DELAY: Duration = Duration::from_millis(500);

/// Pause after a non-clock command so the board can process it.
const COMMAND_SETTLE: Duration = Duration::from_millis(100);

/// Pause after a failed discovery attempt.
const DISCOVERY_RETRY: Duration = Duration::from_millis(100);

/// Polling interval while waiting for the clock lock.
const CLOCK_WAIT_POLL: Duration = Duration::from_millis(100);

/// Waiting this long for the clock lock is worth a warning.
const CLOCK_WAIT_WARN: Duration = Duration::from_secs(3);

/// After this long the clock lock is ignored.
const CLOCK_WAIT_LIMIT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 100;

type CommandSink = FramedWrite<WriteHalf<BoxPort>, FrameCodec>;

/// Mutable per-link state.
#[derive(Debug)]
pub(crate) struct LinkState {
    pub clock: ClockState,
    pub caps: Capabilities,
    pub channel: Channel,
    pub bt_name: String,
    pub device: Option<String>,
    pub low_time: bool,
    pub reversed: bool,
    pub connect_text: Option<ConnectText>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            clock: ClockState::new(),
            caps: Capabilities::default(),
            channel: Channel::Usb,
            bt_name: String::new(),
            device: None,
            low_time: false,
            reversed: false,
            connect_text: None,
        }
    }
}

/// State shared by the reader, the board handles and the timer tasks.
pub(crate) struct Shared {
    pub config: Config,
    writer: tokio::sync::Mutex<Option<CommandSink>>,
    pub state: Mutex<LinkState>,
    events: mpsc::Sender<BoardEvent>,
    link: Mutex<CancellationToken>,
}

impl Shared {
    fn new(config: Config, events: mpsc::Sender<BoardEvent>) -> Self {
        Self {
            config,
            writer: tokio::sync::Mutex::new(None),
            state: Mutex::new(LinkState::default()),
            events,
            link: Mutex::new(CancellationToken::new()),
        }
    }

    pub async fn emit(&self, event: BoardEvent) {
        if self.events.send(event).await.is_err() {
            trace!("event receiver gone");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Write one command.
    ///
    /// Clock commands lock the clock until acked and become the resend
    /// candidate. Other commands are followed by a short pause. A failed
    /// write drops the link; an unencodable command only fails itself.
    pub async fn write_command(&self, command: Command) -> Result<()> {
        match &command {
            Command::ReturnSerialNumber => {}
            Command::Clock(clock) => debug!("board put clock {:?}", clock.id()),
            other => debug!("board put {:?}", other.id()),
        }

        {
            let mut writer = self.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                return Err(Error::Disconnected);
            };

            // feed only encodes into the sink's buffer; nothing is on the
            // wire before the flush below
            let fed = sink.feed(command.clone()).await;
            match fed {
                Ok(()) => {}
                Err(Error::Encode(e)) => {
                    error!("invalid bytes sent {:?}: {}", command, e);
                    return Err(e.into());
                }
                Err(e) => return Err(self.drop_link(&mut writer, e)),
            }

            if command.as_clock().is_some() {
                self.state.lock().clock.record_sent(command.clone());
            }

            let flushed = sink.flush().await;
            if let Err(e) = flushed {
                return Err(self.drop_link(&mut writer, e));
            }
        }

        if let Command::SetLeds { on, .. } = command {
            debug!("leds turned {}", if on { "on" } else { "off" });
        }
        if command.as_clock().is_none() {
            time::sleep(COMMAND_SETTLE).await;
        }
        Ok(())
    }

    fn drop_link(&self, writer: &mut Option<CommandSink>, e: Error) -> Error {
        error!("write to board failed: {}", e);
        *writer = None;
        self.link.lock().cancel();
        e
    }

    /// Resend a rejected or stuck clock command, once.
    pub async fn resend_clock(&self, command: Command) {
        debug!("resending clock command {:?}", command);
        if let Err(e) = self.write_command(command).await {
            warn!("resending clock command failed: {}", e);
        }
        self.state.lock().clock.forget_last_command();
    }

    /// Start the clock version handshake.
    pub async fn startup_serial_clock(&self) {
        let command = self.state.lock().clock.begin_handshake();
        if let Err(e) = self.write_command(command).await {
            debug!("clock handshake not sent: {}", e);
        }
    }

    /// One watchdog tick: free a stuck clock command, then probe.
    pub async fn watchdog_tick(&self) {
        if !self.config.pi_mode {
            let stale = self.state.lock().clock.take_stale_lock();
            match stale {
                Some(Some(command)) => self.resend_clock(command).await,
                Some(None) => debug!("clock lock cleared, nothing to resend"),
                None => {}
            }
        }
        // asked after the resend for the sake of old board firmware
        if let Err(e) = self.write_command(Command::ReturnSerialNumber).await {
            trace!("probe not sent: {}", e);
        }
    }

    /// Wait until no clock command is outstanding.
    ///
    /// Polls rather than blocks so a lost ack costs at most
    /// [`CLOCK_WAIT_LIMIT`].
    pub async fn wait_for_clock(&self, what: &str) {
        let start = Instant::now();
        let mut warned = false;
        let mut waited = false;
        loop {
            let locked = self.state.lock().clock.is_locked();
            if !locked {
                break;
            }
            if !waited {
                debug!("clock is locked, waiting to serve {}", what);
                waited = true;
            }
            let elapsed = start.elapsed();
            if elapsed >= CLOCK_WAIT_LIMIT {
                warn!("clock still locked after {:?}, sending {} anyway", elapsed, what);
                return;
            }
            if elapsed >= CLOCK_WAIT_WARN && !warned {
                warn!("clock is locked over {:?}", CLOCK_WAIT_WARN);
                warned = true;
            }
            time::sleep(CLOCK_WAIT_POLL).await;
        }
        if waited {
            debug!("clock is released now");
        }
    }
}

/// The reader task and the resources it owns.
pub struct Session {
    shared: Arc<Shared>,
    transport: TransportManager,
    codec: FrameCodec,
    buffer: BytesMut,
    reader: Option<ReadHalf<BoxPort>>,
    link: CancellationToken,
    debouncer: FieldDebouncer,
    watchdog: Watchdog,
    paused_watchdog: bool,
    idle_ticks: u32,
}

impl Session {
    /// Create a session, a handle to command the board and the event
    /// stream.
    pub fn new(config: Config, transport: TransportManager) -> (Self, Board, mpsc::Receiver<BoardEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let codec = FrameCodec::new(config.drain);
        let shared = Arc::new(Shared::new(config, tx));
        let session = Self {
            shared: shared.clone(),
            transport,
            codec,
            buffer: BytesMut::with_capacity(1024),
            reader: None,
            link: CancellationToken::new(),
            debouncer: FieldDebouncer::new(),
            watchdog: Watchdog::new(),
            paused_watchdog: false,
            idle_ticks: 0,
        };
        (session, Board::new(shared), rx)
    }

    /// Read and dispatch until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("board reader ready");
        while !shutdown.is_cancelled() {
            if self.reader.is_none() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.connect() => {}
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.poll_once() => {}
                }
            }
        }

        debug!("board reader stopping");
        self.teardown().await;
        self.transport.shutdown().await;
    }

    async fn connect(&mut self) {
        if self.watchdog.is_running() {
            debug!("watchdog timer is stopped now");
            self.watchdog.stop().await;
        }

        let connection = match self.transport.discover().await {
            Discovery::Connected(connection) => connection,
            Discovery::NotFound { text } => {
                self.shared.emit(BoardEvent::NoBoard { text }).await;
                time::sleep(DISCOVERY_RETRY).await;
                return;
            }
        };

        info!(
            "board connected to {} via {}",
            connection.path, connection.channel
        );
        let (reader, writer) = tokio::io::split(connection.port);
        self.link = CancellationToken::new();
        *self.shared.link.lock() = self.link.clone();
        *self.shared.writer.lock().await = Some(FramedWrite::new(writer, FrameCodec::default()));
        {
            let mut state = self.shared.state.lock();
            state.channel = connection.channel;
            state.bt_name = connection.bt_name;
            state.device = Some(connection.path);
            state.caps = Capabilities::default();
            state.connect_text = None;
        }
        self.reader = Some(reader);
        self.codec.reset();
        self.buffer.clear();
        self.idle_ticks = 0;

        debug!("sleeping for {:?}, then starting up the board", STARTUP_DELAY);
        time::sleep(STARTUP_DELAY).await;
        for command in [Command::SendUpdateNice, Command::SendVersion] {
            if let Err(e) = self.shared.write_command(command).await {
                warn!("board startup failed: {}", e);
                break;
            }
        }
    }

    async fn poll_once(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };

        let read = tokio::select! {
            _ = self.link.cancelled() => None,
            read = time::timeout(READ_TIMEOUT, reader.read_buf(&mut self.buffer)) => Some(read),
        };
        let Some(read) = read else {
            debug!("link dropped by writer");
            self.teardown().await;
            return;
        };

        match read {
            Ok(Ok(0)) => {
                warn!("board closed the connection");
                self.teardown().await;
            }
            Ok(Ok(n)) => {
                trace!("read {} bytes", n);
                self.drain_frames().await;
            }
            Ok(Err(e)) => {
                warn!("read from board failed: {}", e);
                self.teardown().await;
            }
            Err(_) => {
                // lets an abandoned bulk drain time out
                self.drain_frames().await;
                self.on_idle().await;
            }
        }
    }

    async fn on_idle(&mut self) {
        self.idle_ticks = (self.idle_ticks + 1) % IDLE_PROBE_TICKS;
        if self.idle_ticks == 0 && !self.watchdog.is_running() && !self.codec.is_draining() {
            // a freshly plugged board stays silent until asked
            self.shared.watchdog_tick().await;
        }
    }

    async fn drain_frames(&mut self) {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(Inbound::Frame(frame))) => self.dispatch(frame).await,
                Ok(Some(Inbound::DrainStarted { bytes })) => {
                    debug!("pausing watchdog while {} bytes drain", bytes);
                    if self.watchdog.is_running() {
                        self.watchdog.stop().await;
                        self.paused_watchdog = true;
                    }
                }
                Ok(Some(Inbound::DrainFinished { discarded, complete })) => {
                    debug!(discarded, complete, "drain finished");
                    if std::mem::take(&mut self.paused_watchdog) {
                        self.start_watchdog();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("frame decoding failed: {}", e);
                    self.buffer.clear();
                    break;
                }
            }
        }
    }

    fn start_watchdog(&mut self) {
        let shared = self.shared.clone();
        self.watchdog.start(WATCHDOG_PERIOD, move || {
            let shared = shared.clone();
            async move { shared.watchdog_tick().await }
        });
    }

    async fn teardown(&mut self) {
        let was_connected = self.reader.take().is_some();
        self.link.cancel();
        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.debouncer.cancel().await;
        self.watchdog.stop().await;
        self.paused_watchdog = false;
        self.buffer.clear();
        self.codec.reset();
        if was_connected {
            info!("board disconnected");
        }
    }
}
