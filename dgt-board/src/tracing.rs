//! Provide tracing, tailored to this program.
//!
//! The daemon calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Everything else does `use crate::tracing::prelude::*` for the
//! `trace!()`, `debug!()`, `info!()`, `warn!()` and `error!()` macros.
//!
//! Set `RUST_LOG=dgt_board=trace` to see every byte exchanged with the board.

use std::{env, fmt};
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

#[allow(unused_imports)]
use prelude::*;

/// Target prefix stripped from our own log lines.
const CRATE_TARGET: &str = "dgt_board::";

/// Wire bytes formatted as space-separated hex for trace logs.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Check if stderr is connected to the systemd journal.
///
/// JOURNAL_STREAM holds "device:inode" of the journal socket; compare it with
/// stderr so a redirected stderr is not mistaken for the journal.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };

    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev as u64 == expected_dev && stat.st_ino as u64 == expected_ino
}

/// Initialize logging.
///
/// Under systemd, log to the journal; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            }
            eprintln!("Failed to initialize journald logging, using stdout.");
        }
    }

    use_stdout();
}

// Log to stdout, filtering according to RUST_LOG with INFO as the default
// level.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true)
                .fmt_fields(DefaultFields::new())
                .event_format(CustomFormatter),
        )
        .init();
}

/// Event formatter that shortens our own targets, colors the level and puts
/// structured fields on a second line.
struct CustomFormatter;

/// Visitor that collects the message and fields of an event.
#[derive(Default)]
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
            return;
        }
        let cleaned = match formatted.strip_prefix("Some(") {
            Some(inner) => inner.strip_suffix(')').unwrap_or(inner).to_string(),
            None => formatted,
        };
        self.fields.push((field.name().to_string(), cleaned));
    }
}

fn short_target(target: &str, fields: &[(String, String)]) -> String {
    if let Some(stripped) = target.strip_prefix(CRATE_TARGET) {
        return stripped.to_string();
    }
    if target == "log" {
        // log compatibility layer carries the real target as a field
        if let Some((_, v)) = fields.iter().find(|(k, _)| k == "log.target") {
            return v.trim_matches('"').to_string();
        }
    }
    target.to_string()
}

impl<S, N> FormatEvent<S, N> for CustomFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let (level_color, level_text) = match *event.metadata().level() {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(writer, "{}{}\x1b[0m ", level_color, level_text)?;

        let target = short_target(event.metadata().target(), &visitor.fields);
        write!(writer, "{}: ", target)?;

        if let Some(ref msg) = visitor.message {
            write!(writer, "{}", msg.trim_matches('"'))?;
        }

        let display_fields: Vec<_> = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log."))
            .collect();

        if !display_fields.is_empty() {
            writeln!(writer)?;
            // timestamp (8) + space + level (5) + space
            write!(writer, "\x1b[90m               ")?;
            for (i, (key, value)) in display_fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

// Local time to the nearest second; the default timer prints long UTC
// timestamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_bytes_are_space_separated() {
        assert_eq!(HexBytes(&[0x93, 0x00, 0x05, 0x02]).to_string(), "93 00 05 02");
        assert_eq!(HexBytes(&[]).to_string(), "");
    }

    #[test]
    fn own_targets_are_shortened() {
        assert_eq!(short_target("dgt_board::session", &[]), "session");
        assert_eq!(short_target("mio::poll", &[]), "mio::poll");

        let fields = vec![("log.target".to_string(), "\"serialport\"".to_string())];
        assert_eq!(short_target("log", &fields), "serialport");
    }
}
