//! DGT board protocol dissector for Saleae Logic 2 captures.

mod capture;
mod dissect;
mod output;
mod serial;

use anyhow::{Context, Result};
use capture::{CaptureReader, Channel};
use clap::Parser;
use dissect::dissect_decoded_frame;
use output::OutputConfig;
use serial::{CommandStreamingParser, MessageStreamingParser};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

/// Protocol dissector for DGT e-board serial captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to Saleae Logic 2 CSV export file
    input: PathBuf,

    /// Show raw hex data for each frame
    #[arg(short = 'x', long)]
    hex: bool,

    /// Use absolute timestamps instead of relative (seconds from start)
    #[arg(short = 'a', long)]
    absolute_time: bool,

    /// Filter by channel (TX, RX)
    #[arg(short = 'f', long)]
    filter_channel: Option<String>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Force color output even when not connected to a TTY
    #[arg(long)]
    force_color: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("dgt_board=trace".parse()?),
            )
            .init();
    }

    let mut reader = CaptureReader::open(&args.input)
        .with_context(|| format!("Failed to open capture file: {:?}", args.input))?;

    if args.force_color {
        colored::control::set_override(true);
    } else if args.no_color || (args.output.is_some() || !std::io::stdout().is_terminal()) {
        colored::control::set_override(false);
    }

    let mut commands = CommandStreamingParser::new();
    let mut messages = MessageStreamingParser::new();
    let mut decoded_frames = Vec::new();

    for event in reader.events() {
        let event = event?;

        if let Some(ref filter) = args.filter_channel {
            let channel_name = format!("{:?}", event.channel);
            if !filter.eq_ignore_ascii_case(&channel_name) {
                continue;
            }
        }

        if let Some(error) = &event.error {
            tracing::warn!("{:?} byte at {:.6} has error {}", event.channel, event.timestamp, error);
        }

        match event.channel {
            Channel::TX => decoded_frames.extend(commands.process_event(&event)),
            Channel::RX => decoded_frames.extend(messages.process_event(&event)),
        }
    }

    let mut dissected: Vec<_> = decoded_frames.iter().map(dissect_decoded_frame).collect();
    dissected.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let output_config = OutputConfig {
        show_raw_hex: args.hex,
        use_relative_time: !args.absolute_time,
        start_time: dissected.first().map(|f| f.timestamp),
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {:?}", path))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    for frame in dissected {
        writeln!(out, "{}", frame.format(&output_config))?;
    }

    Ok(())
}
