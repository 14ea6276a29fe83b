//! Saleae Logic 2 CSV capture parsing.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::io::Read;
use std::path::Path;

/// Raw event from Saleae Logic 2 CSV export
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub start_time: f64,
    pub data: Option<String>,
    pub error: Option<String>,
}

/// Serial channel event
#[derive(Debug, Clone)]
pub struct SerialEvent {
    pub channel: Channel,
    pub timestamp: f64,
    pub data: u8,
    pub error: Option<String>,
}

/// Serial channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Host to board
    TX,
    /// Board to host
    RX,
}

impl RawEvent {
    /// Parse raw event into a serial event, if it is one
    pub fn parse(&self) -> Result<Option<SerialEvent>> {
        let channel = if self.name.starts_with("TX") {
            Channel::TX
        } else if self.name.starts_with("RX") {
            Channel::RX
        } else {
            return Ok(None);
        };

        if self.event_type != "data" {
            return Ok(None);
        }

        let Some(data_str) = &self.data else {
            return Ok(None);
        };
        let data =
            parse_hex_value(data_str).with_context(|| format!("Failed to parse data: {}", data_str))?;

        Ok(Some(SerialEvent {
            channel,
            timestamp: self.start_time,
            data,
            error: self.error.clone().filter(|e| !e.is_empty()),
        }))
    }
}

/// Parse hex value from string (handles 0x prefix)
fn parse_hex_value(s: &str) -> Result<u8> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(s, 16).with_context(|| format!("Invalid hex value: {}", s))
}

/// CSV capture reader
pub struct CaptureReader<R> {
    reader: csv::Reader<R>,
}

impl CaptureReader<std::fs::File> {
    /// Open a CSV capture file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())
            .with_context(|| format!("Failed to open capture file: {:?}", path.as_ref()))?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> CaptureReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader: csv::Reader::from_reader(reader),
        }
    }

    /// Read and parse events
    pub fn events(&mut self) -> impl Iterator<Item = Result<SerialEvent>> + '_ {
        self.reader
            .deserialize::<RawEvent>()
            .filter_map(move |result| match result {
                Ok(raw_event) => raw_event.parse().transpose(),
                Err(e) => Some(Err(e.into())),
            })
    }
}

/// Custom deserializer for timestamps that handles both numeric and ISO format
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimeValue {
        String(String),
        Float(f64),
    }

    match TimeValue::deserialize(deserializer)? {
        TimeValue::Float(f) => Ok(f),
        TimeValue::String(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&s) {
                Ok(dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 / 1_000_000_000.0)
            } else {
                s.parse::<f64>().map_err(D::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = "\
name,type,start_time,duration,data,error
TX Async Serial,data,0.500000,0.001,0x4D,
RX Async Serial,data,0.510000,0.001,0x93,
RX Async Serial,data,0.511000,0.001,0x00,
Channel 3,data,0.512000,0.001,0x00,
RX Async Serial,error,0.513000,0.001,0x00,framing
TX Async Serial,data,2024-01-01T00:00:01.250000Z,0.001,0x42,
";

    #[test]
    fn reads_tx_and_rx_data_events() {
        let mut reader = CaptureReader::from_reader(CAPTURE.as_bytes());
        let events: Vec<SerialEvent> = reader.events().collect::<Result<_>>().unwrap();

        let summary: Vec<(Channel, u8)> = events.iter().map(|e| (e.channel, e.data)).collect();
        assert_eq!(
            summary,
            vec![
                (Channel::TX, 0x4d),
                (Channel::RX, 0x93),
                (Channel::RX, 0x00),
                (Channel::TX, 0x42),
            ]
        );
        assert!(events.iter().all(|e| e.error.is_none()));
        assert_eq!(events[0].timestamp, 0.5);
        assert_eq!(events[3].timestamp, 1_704_067_201.25);
    }

    #[test]
    fn hex_values_with_and_without_prefix() {
        assert_eq!(parse_hex_value("0x8D").unwrap(), 0x8d);
        assert_eq!(parse_hex_value(" 2b ").unwrap(), 0x2b);
        assert!(parse_hex_value("0xZZ").is_err());
    }
}
