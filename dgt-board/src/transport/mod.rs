//! Physical transport to the board.
//!
//! The board is a plain byte stream, either a USB CDC serial port or an
//! RFCOMM tunnel brought up by the Bluetooth pairing automaton. Discovery
//! tries, in order, the configured device path, the local serial ports and
//! Bluetooth pairing. Each call makes one attempt; the caller retries from
//! its own loop.

pub mod bluetooth;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use crate::config::Config;
use crate::error::Result;
use crate::event::ConnectText;
use crate::tracing::prelude::*;

use bluetooth::BluetoothPairing;

/// Line speed of every DGT board.
pub const BAUD_RATE: u32 = 9600;

/// Frames of the "searching" spinner.
pub const SPINNER: [char; 4] = ['/', '-', '\\', '|'];

/// A bidirectional byte stream to the board.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Port for T {}

pub type BoxPort = Box<dyn Port>;

/// How the board is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Usb,
    Bluetooth,
}

impl Channel {
    /// RFCOMM device nodes are Bluetooth, everything else counts as USB.
    pub fn for_path(path: &str) -> Self {
        if path.contains("rfc") {
            Channel::Bluetooth
        } else {
            Channel::Usb
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Usb => write!(f, "USB"),
            Channel::Bluetooth => write!(f, "BT"),
        }
    }
}

/// An open transport.
pub struct Connection {
    pub port: BoxPort,
    pub path: String,
    pub channel: Channel,
    /// Advertised name of a paired Bluetooth board, empty otherwise
    pub bt_name: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("channel", &self.channel)
            .field("bt_name", &self.bt_name)
            .finish_non_exhaustive()
    }
}

/// Opens a device path as a [`Port`].
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, path: &str) -> Result<BoxPort>;
}

/// Opens serial ports with the board's fixed line settings, 9600 8N1.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, path: &str) -> Result<BoxPort> {
        let stream = tokio_serial::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        Ok(Box::new(stream))
    }
}

/// Local device nodes a board may sit behind, sorted by name.
pub fn local_port_candidates(dev_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dev_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("ttyACM") || name.starts_with("ttyUSB") || name == "rfcomm0"
        })
        .map(|entry| entry.path())
        .collect();
    found.sort();
    Ok(found)
}

/// Outcome of one discovery attempt.
#[derive(Debug)]
pub enum Discovery {
    Connected(Connection),
    /// Nothing answered; show this text and try again later
    NotFound { text: ConnectText },
}

/// Finds and opens the board.
pub struct TransportManager {
    device: Option<String>,
    opener: Arc<dyn PortOpener>,
    dev_dir: PathBuf,
    bluetooth: Option<BluetoothPairing>,
    spinner: usize,
}

impl TransportManager {
    pub fn new(config: &Config, opener: Arc<dyn PortOpener>) -> Self {
        let bluetooth = (config.bluetooth && config.device.is_none() && BluetoothPairing::available())
            .then(BluetoothPairing::new);
        Self {
            device: config.device.clone(),
            opener,
            dev_dir: PathBuf::from("/dev"),
            bluetooth,
            spinner: 0,
        }
    }

    /// Look for local ports somewhere other than `/dev`.
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    /// Disable the Bluetooth fallback.
    pub fn without_bluetooth(mut self) -> Self {
        self.bluetooth = None;
        self
    }

    /// Make one attempt to find and open the board.
    pub async fn discover(&mut self) -> Discovery {
        if let Some(connection) = self.try_open().await {
            debug!("board connected to {}", connection.path);
            self.spinner = 0;
            return Discovery::Connected(connection);
        }

        let text = ConnectText::searching(SPINNER[self.spinner]);
        self.spinner = (self.spinner + 1) % SPINNER.len();
        Discovery::NotFound { text }
    }

    /// Stop a pairing attempt in progress, killing its helper processes.
    pub async fn shutdown(&mut self) {
        if let Some(bt) = self.bluetooth.as_mut() {
            bt.shutdown().await;
        }
    }

    async fn try_open(&mut self) -> Option<Connection> {
        if let Some(device) = self.device.clone() {
            return self.open_path(&device).await;
        }

        match local_port_candidates(&self.dev_dir) {
            Ok(candidates) => {
                for path in candidates {
                    if let Some(connection) = self.open_path(&path.to_string_lossy()).await {
                        return Some(connection);
                    }
                }
            }
            Err(e) => warn!("cannot list {}: {}", self.dev_dir.display(), e),
        }

        let bt = self.bluetooth.as_mut()?;
        match bt.poll(self.opener.as_ref()).await {
            Ok(Some((port, name))) => Some(Connection {
                port,
                path: bluetooth::RFCOMM_PATH.to_string(),
                channel: Channel::Bluetooth,
                bt_name: name,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("bluetooth pairing failed: {}", e);
                bt.shutdown().await;
                None
            }
        }
    }

    async fn open_path(&self, path: &str) -> Option<Connection> {
        match self.opener.open(path).await {
            Ok(port) => Some(Connection {
                port,
                path: path.to_string(),
                channel: Channel::for_path(path),
                bt_name: String::new(),
            }),
            Err(e) => {
                trace!("cannot open {}: {}", path, e);
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeOpener;
    use super::*;

    fn scratch_dir(name: &str, entries: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dgt-board-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for entry in entries {
            std::fs::write(dir.join(entry), b"").unwrap();
        }
        dir
    }

    fn manager(config: &Config, opener: Arc<FakeOpener>, dev_dir: &Path) -> TransportManager {
        TransportManager::new(config, opener)
            .with_dev_dir(dev_dir)
            .without_bluetooth()
    }

    #[test]
    fn candidates_match_known_names() {
        let dir = scratch_dir("candidates", &["ttyUSB0", "ttyACM1", "rfcomm0", "rfcomm1", "tty0", "sda"]);
        let names: Vec<String> = local_port_candidates(&dir)
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["rfcomm0", "ttyACM1", "ttyUSB0"]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn channel_follows_path() {
        assert_eq!(Channel::for_path("/dev/ttyACM0"), Channel::Usb);
        assert_eq!(Channel::for_path("/dev/rfcomm123"), Channel::Bluetooth);
        assert_eq!(Channel::Bluetooth.to_string(), "BT");
    }

    #[tokio::test]
    async fn configured_device_is_the_only_candidate() {
        let dir = scratch_dir("configured", &["ttyACM0"]);
        let config = Config {
            device: Some("/dev/rfcomm7".into()),
            ..Config::default()
        };
        let opener = Arc::new(FakeOpener::with(&["/dev/rfcomm7"]));
        let mut transport = manager(&config, opener.clone(), &dir);

        let Discovery::Connected(connection) = transport.discover().await else {
            panic!("expected a connection");
        };
        assert_eq!(connection.path, "/dev/rfcomm7");
        assert_eq!(connection.channel, Channel::Bluetooth);
        assert_eq!(*opener.opened.lock(), vec!["/dev/rfcomm7".to_string()]);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn enumerated_ports_are_tried_in_order() {
        let dir = scratch_dir("enumerated", &["ttyACM0", "ttyACM1"]);
        let second = dir.join("ttyACM1").to_string_lossy().into_owned();
        let opener = Arc::new(FakeOpener::with(&[second.as_str()]));
        let mut transport = manager(&Config::default(), opener.clone(), &dir);

        let Discovery::Connected(connection) = transport.discover().await else {
            panic!("expected a connection");
        };
        assert_eq!(connection.path, second);
        assert_eq!(connection.channel, Channel::Usb);
        assert_eq!(opener.opened.lock().len(), 2);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn spinner_rotates_while_searching() {
        let dir = scratch_dir("spinner", &[]);
        let opener = Arc::new(FakeOpener::default());
        let mut transport = manager(&Config::default(), opener, &dir);

        let mut smalls = Vec::new();
        for _ in 0..5 {
            match transport.discover().await {
                Discovery::NotFound { text } => smalls.push(text.small),
                Discovery::Connected(_) => panic!("nothing to connect to"),
            }
        }
        assert_eq!(smalls, vec!["/", "-", "\\", "|", "/"]);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
