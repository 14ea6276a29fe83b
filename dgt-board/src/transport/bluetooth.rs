//! Bluetooth pairing through `bluetoothctl` and `rfcomm`.
//!
//! Pairing is driven by scraping the text output of `bluetoothctl`. The
//! decisions live in [`PairingAutomaton`], a pure state machine fed with
//! whatever text the process printed; [`BluetoothPairing`] owns the
//! processes and carries out the automaton's [`Action`]s.
//!
//! ```text
//! Idle -> PoweringOn -> RegisteringAgent -> AgentRegistered -> Scanning
//!   -> Discovering <-> Pairing -> Paired -> RfcommConnecting -> Connected
//! ```
//!
//! Nothing is remembered between runs of the daemon.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time;

use super::{BoxPort, PortOpener};
use crate::tracing::prelude::*;

/// The control tool.
pub const BLUETOOTHCTL: &str = "/usr/bin/bluetoothctl";

/// RFCOMM channel number used for the board.
pub const RFCOMM_CHANNEL: &str = "123";

/// Device node that appears once the RFCOMM link is up.
pub const RFCOMM_PATH: &str = "/dev/rfcomm123";

/// Pause before starting over after every candidate failed.
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// How long bluetoothctl gets to exit after `quit` before it is killed.
const QUIT_GRACE: Duration = Duration::from_secs(1);

/// Control process failures.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to talk to bluetoothctl: {0}")]
    Control(#[source] std::io::Error),

    #[error("bluetoothctl exited")]
    ControlExited,
}

/// Board families that can be paired, told apart by advertised name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardFamily {
    DgtBt,
    RevelationII,
}

impl BoardFamily {
    fn from_name(name: &str) -> Option<Self> {
        if name.contains("DGT_BT_") {
            Some(BoardFamily::DgtBt)
        } else if name.contains("PCS-REVII") {
            Some(BoardFamily::RevelationII)
        } else {
            None
        }
    }

    pub fn pin(&self) -> &'static str {
        match self {
            BoardFamily::DgtBt => "0000",
            BoardFamily::RevelationII => "1234",
        }
    }
}

/// A board seen during the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    PoweringOn,
    RegisteringAgent,
    AgentRegistered,
    Scanning,
    Discovering,
    Pairing,
    Paired,
    RfcommConnecting,
    Connected,
}

/// Something the driver has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a line to bluetoothctl
    Send(String),
    /// Run `rfcomm connect` to this address
    ConnectRfcomm { address: String },
    /// Stop bluetoothctl and start over after a pause
    Restart { after: Duration },
}

fn send(line: impl Into<String>) -> Action {
    Action::Send(line.into())
}

/// The pairing state machine.
#[derive(Debug)]
pub struct PairingAutomaton {
    stage: Stage,
    candidates: Vec<Candidate>,
    current: Option<usize>,
    line: String,
}

impl Default for PairingAutomaton {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            candidates: Vec::new(),
            current: None,
            line: String::new(),
        }
    }
}

impl PairingAutomaton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn current(&self) -> Option<&Candidate> {
        self.current.and_then(|i| self.candidates.get(i))
    }

    /// Begin a fresh run; bluetoothctl was just started.
    pub fn start(&mut self) -> Vec<Action> {
        *self = Self::default();
        self.stage = Stage::PoweringOn;
        vec![send("power on")]
    }

    /// Consume output of bluetoothctl.
    ///
    /// Complete lines are matched as they arrive. Prompts are matched
    /// without waiting for a newline since bluetoothctl leaves the cursor
    /// behind them.
    pub fn feed(&mut self, text: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        for piece in text.split_inclusive('\n') {
            self.line.push_str(piece);
            if self.line.ends_with('\n') {
                let line = std::mem::take(&mut self.line);
                self.on_line(&line, &mut actions);
            }
            self.on_prompt(&mut actions);
        }
        self.advance(&mut actions);
        actions
    }

    /// The RFCOMM device appeared and was opened.
    pub fn rfcomm_ready(&mut self) -> Vec<Action> {
        if let Some(candidate) = self.current() {
            debug!("BT connected to {}", candidate.name);
        }
        self.stage = Stage::Connected;
        vec![send("quit")]
    }

    /// `rfcomm connect` exited without bringing the link up.
    pub fn rfcomm_failed(&mut self) -> Vec<Action> {
        debug!("BT rfcomm failed");
        let mut actions = Vec::new();
        if let Some(index) = self.current.filter(|&i| i < self.candidates.len()) {
            let candidate = self.candidates.remove(index);
            debug!("removing device {} {}", candidate.address, candidate.name);
            actions.push(send(format!("remove {}", candidate.address)));
            self.current = index.checked_sub(1);
        }

        if self.candidates.is_empty() {
            debug!("no BT candidates left, restarting bluetoothctl");
            actions.push(send("quit"));
            actions.push(Action::Restart {
                after: RESTART_DELAY,
            });
            *self = Self::default();
        } else {
            self.stage = Stage::Discovering;
            self.advance(&mut actions);
        }
        actions
    }

    fn on_line(&mut self, line: &str, actions: &mut Vec<Action>) {
        if line.contains("Changing power on succeeded") {
            self.stage = Stage::RegisteringAgent;
            actions.push(send("agent on"));
        } else if line.contains("Agent registered") || line.contains("Agent is already registered") {
            self.stage = Stage::AgentRegistered;
            actions.push(send("default-agent"));
        } else if line.contains("Default agent request successful") {
            self.stage = Stage::Scanning;
            // BlueZ no longer lists paired devices on its own
            actions.push(send("scan on"));
            actions.push(send("devices Paired"));
        } else if line.contains("Discovering: yes") {
            self.stage = Stage::Discovering;
        } else if line.contains("Pairing successful") {
            debug!("BT pairing successful");
            self.stage = Stage::Paired;
        } else if line.contains("Failed to pair: org.bluez.Error.AlreadyExists") {
            debug!("BT already paired");
            self.stage = Stage::Paired;
        } else if line.contains("Failed to pair") {
            debug!("BT pairing failed");
            self.stage = Stage::Discovering;
        } else if line.contains("not available") {
            debug!("BT pairing failed, not available");
            self.stage = Stage::Discovering;
            if let Some(index) = self.current.filter(|&i| i < self.candidates.len()) {
                let candidate = self.candidates.remove(index);
                debug!("removing device {} {}", candidate.address, candidate.name);
                self.current = index.checked_sub(1);
            }
        } else if line.contains(" DGT_BT_") || line.contains(" PCS-REVII") {
            // the leading space keeps prompt echoes like "[DGT_BT_...]" out
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [.., address, name] = fields.as_slice() else {
                error!("BT wrong line [{}]", line.trim_end());
                return;
            };
            if !self.candidates.iter().any(|c| c.address == *address) {
                debug!("BT found device {} {}", address, name);
                self.candidates.push(Candidate {
                    address: address.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    fn on_prompt(&mut self, actions: &mut Vec<Action>) {
        if self.line.contains("PIN code") {
            match self.current().and_then(|c| BoardFamily::from_name(&c.name)) {
                Some(family) => actions.push(send(family.pin())),
                None => warn!("BT PIN requested without a known candidate"),
            }
            self.line.clear();
        }
        if self.line.contains("Confirm passkey") {
            actions.push(send("yes"));
            self.line.clear();
        }
    }

    fn advance(&mut self, actions: &mut Vec<Action>) {
        if self.stage == Stage::Discovering && !self.candidates.is_empty() {
            let next = self.current.map_or(0, |i| i + 1);
            let next = if next >= self.candidates.len() { 0 } else { next };
            self.current = Some(next);
            self.stage = Stage::Pairing;
            let candidate = &self.candidates[next];
            debug!("BT pairing to {} {}", candidate.address, candidate.name);
            actions.push(send(format!("pair {}", candidate.address)));
        }

        if self.stage == Stage::Paired {
            if let Some(candidate) = self.current() {
                let address = candidate.address.clone();
                self.stage = Stage::RfcommConnecting;
                actions.push(Action::ConnectRfcomm { address });
            } else {
                self.stage = Stage::Discovering;
            }
        }
    }
}

struct ControlProcess {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<String>,
}

/// Wait up to `grace` for `child` to exit, then kill it. Returns whether it
/// exited by itself.
async fn reap(child: &mut Child, grace: Duration) -> bool {
    match time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            trace!("helper exited with {}", status);
            true
        }
        Ok(Err(e)) => {
            warn!("waiting for helper failed: {}", e);
            let _ = child.kill().await;
            false
        }
        Err(_) => {
            debug!("helper still running after {:?}, killing it", grace);
            let _ = child.kill().await;
            false
        }
    }
}

/// Runs the pairing automaton against the real tools.
pub struct BluetoothPairing {
    automaton: PairingAutomaton,
    control: Option<ControlProcess>,
    rfcomm: Option<Child>,
}

impl BluetoothPairing {
    pub fn new() -> Self {
        Self {
            automaton: PairingAutomaton::new(),
            control: None,
            rfcomm: None,
        }
    }

    /// Whether this host has the tools at all.
    pub fn available() -> bool {
        Path::new(BLUETOOTHCTL).exists()
    }

    /// Advance pairing without blocking. Returns the open RFCOMM port and
    /// the board's name once a board is connected.
    pub async fn poll(
        &mut self,
        opener: &dyn PortOpener,
    ) -> Result<Option<(BoxPort, String)>, PairingError> {
        if self.control.is_none() {
            self.launch().await?;
            let actions = self.automaton.start();
            self.perform(actions).await?;
            return Ok(None);
        }

        let mut output = String::new();
        if let Some(control) = self.control.as_mut() {
            loop {
                match control.output.try_recv() {
                    Ok(chunk) => output.push_str(&chunk),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if output.is_empty() {
                            return Err(PairingError::ControlExited);
                        }
                        break;
                    }
                }
            }
        }
        if !output.is_empty() {
            trace!("bluetoothctl: {:?}", output);
            let actions = self.automaton.feed(&output);
            self.perform(actions).await?;
        }

        if self.automaton.stage() != Stage::RfcommConnecting {
            return Ok(None);
        }

        if Path::new(RFCOMM_PATH).exists() {
            if let Ok(port) = opener.open(RFCOMM_PATH).await {
                let name = self
                    .automaton
                    .current()
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let actions = self.automaton.rfcomm_ready();
                self.perform(actions).await?;
                self.finish().await;
                return Ok(Some((port, name)));
            }
        }

        let exited = match self.rfcomm.as_mut() {
            Some(child) => child.try_wait().map_err(PairingError::Control)?.is_some(),
            None => true,
        };
        if exited {
            self.rfcomm = None;
            let actions = self.automaton.rfcomm_failed();
            self.perform(actions).await?;
        }
        Ok(None)
    }

    /// Kill the helper processes and forget all progress.
    pub async fn shutdown(&mut self) {
        if let Some(mut rfcomm) = self.rfcomm.take() {
            let _ = rfcomm.kill().await;
        }
        self.finish().await;
        self.automaton = PairingAutomaton::new();
    }

    async fn finish(&mut self) {
        if let Some(ControlProcess { mut child, stdin, .. }) = self.control.take() {
            // end of input makes bluetoothctl quit on its own
            drop(stdin);
            reap(&mut child, QUIT_GRACE).await;
        }
    }

    async fn launch(&mut self) -> Result<(), PairingError> {
        if Path::new(RFCOMM_PATH).exists() && std::env::consts::ARCH != "x86_64" {
            debug!("BT releasing {}", RFCOMM_PATH);
            let status = Command::new("sudo")
                .args(["rfcomm", "release", RFCOMM_CHANNEL])
                .status()
                .await;
            if let Err(e) = status {
                warn!("rfcomm release failed: {}", e);
            }
        }

        debug!("BT starting bluetoothctl");
        let mut child = Command::new(BLUETOOTHCTL)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PairingError::Spawn {
                program: BLUETOOTHCTL,
                source,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tx));
        }
        let stdin = child.stdin.take().ok_or_else(|| {
            PairingError::Control(std::io::Error::other("bluetoothctl has no stdin"))
        })?;

        self.control = Some(ControlProcess {
            child,
            stdin,
            output: rx,
        });
        Ok(())
    }

    async fn perform(&mut self, actions: Vec<Action>) -> Result<(), PairingError> {
        for action in actions {
            match action {
                Action::Send(line) => {
                    let Some(control) = self.control.as_mut() else {
                        return Err(PairingError::ControlExited);
                    };
                    trace!("bluetoothctl <- {}", line);
                    control
                        .stdin
                        .write_all(format!("{}\n", line).as_bytes())
                        .await
                        .map_err(PairingError::Control)?;
                    control.stdin.flush().await.map_err(PairingError::Control)?;
                }
                Action::ConnectRfcomm { address } => {
                    debug!("BT rfcomm connect {}", address);
                    let child = Command::new("sudo")
                        .args(["rfcomm", "connect", RFCOMM_CHANNEL, &address])
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .spawn()
                        .map_err(|source| PairingError::Spawn {
                            program: "rfcomm",
                            source,
                        })?;
                    self.rfcomm = Some(child);
                }
                Action::Restart { after } => {
                    self.finish().await;
                    tokio::time::sleep(after).await;
                }
            }
        }
        Ok(())
    }
}

impl Default for BluetoothPairing {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward_output<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}
