//! Output formatting for dissected frames.

use colored::Colorize;

use crate::dissect::{DissectedFrame, FrameStatus};
use crate::serial::Direction;

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub show_raw_hex: bool,
    pub use_relative_time: bool,
    pub start_time: Option<f64>,
}

impl DissectedFrame {
    /// One output line.
    pub fn format(&self, config: &OutputConfig) -> String {
        let time = match (config.use_relative_time, config.start_time) {
            (true, Some(start)) => format!("{:>12.6}", self.timestamp - start),
            _ => format!("{:>17.6}", self.timestamp),
        };

        let arrow = match self.direction {
            Direction::HostToBoard => "TX ->".cyan(),
            Direction::BoardToHost => "RX <-".magenta(),
        };

        let content = match self.status {
            FrameStatus::Valid => self.content.normal(),
            FrameStatus::Malformed | FrameStatus::Unknown => self.content.bold(),
        };

        let mut line = format!("{} {} {}", time, arrow, content);
        if self.status != FrameStatus::Valid {
            line.push_str(&format!(" [{}]", self.status));
        }
        if config.show_raw_hex && !self.raw_data.is_empty() {
            let hex: Vec<String> = self.raw_data.iter().map(|b| format!("{:02x}", b)).collect();
            line.push_str(&format!("\n{:>w$} {}", "", hex.join(" ").dimmed(), w = time.len()));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(status: FrameStatus) -> DissectedFrame {
        DissectedFrame {
            timestamp: 1.5,
            direction: Direction::HostToBoard,
            raw_data: vec![0x42],
            content: "SEND_BRD".into(),
            status,
        }
    }

    #[test]
    fn relative_time_and_hex() {
        colored::control::set_override(false);
        let config = OutputConfig {
            show_raw_hex: true,
            use_relative_time: true,
            start_time: Some(1.0),
        };
        let line = frame(FrameStatus::Valid).format(&config);
        assert_eq!(line, "    0.500000 TX -> SEND_BRD\n             42");
    }

    #[test]
    fn problems_are_tagged() {
        colored::control::set_override(false);
        let config = OutputConfig {
            show_raw_hex: false,
            use_relative_time: false,
            start_time: None,
        };
        let line = frame(FrameStatus::Unknown).format(&config);
        assert!(line.ends_with("SEND_BRD [UNKNOWN]"));
    }
}
