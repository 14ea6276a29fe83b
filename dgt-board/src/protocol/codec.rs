//! Frame reader for the board-to-host byte stream.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use super::command::Command;
use super::{Frame, HEADER_LEN, MAX_PAYLOAD_LEN, is_frame_start};
use crate::config::DrainPolicy;
use crate::error::Error;
use crate::tracing::{HexBytes, prelude::*};

/// What the reader got out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete frame
    Frame(Frame),
    /// A bulk EE_MOVES transfer is being discarded
    DrainStarted { bytes: usize },
    /// The bulk transfer is over, either fully read or abandoned
    DrainFinished { discarded: usize, complete: bool },
}

#[derive(Debug)]
struct Drain {
    remaining: usize,
    discarded: usize,
    started: Instant,
}

/// Codec turning the raw byte stream into [`Frame`]s and [`Command`]s into
/// bytes.
///
/// Decoding never fails. Garbage is skipped up to the next frame start, a
/// bad length drops the header byte and resynchronizes, and a frame start
/// inside a header or payload abandons the partial frame and restarts at
/// that byte.
#[derive(Debug, Default)]
pub struct FrameCodec {
    policy: DrainPolicy,
    drain: Option<Drain>,
}

impl FrameCodec {
    pub fn new(policy: DrainPolicy) -> Self {
        Self {
            policy,
            drain: None,
        }
    }

    /// Whether a bulk transfer is currently being discarded.
    pub fn is_draining(&self) -> bool {
        self.drain.is_some()
    }

    /// Forget any partial state, e.g. after the transport was reopened.
    pub fn reset(&mut self) {
        self.drain = None;
    }

    fn continue_drain(&mut self, src: &mut BytesMut) -> Option<Inbound> {
        let drain = self.drain.as_mut()?;

        let n = drain.remaining.min(src.len());
        src.advance(n);
        drain.remaining -= n;
        drain.discarded += n;

        if drain.remaining == 0 {
            let discarded = drain.discarded;
            self.drain = None;
            debug!(discarded, "EE_MOVES transfer discarded");
            return Some(Inbound::DrainFinished {
                discarded,
                complete: true,
            });
        }

        if drain.started.elapsed() > self.policy.ceiling {
            let (discarded, remaining) = (drain.discarded, drain.remaining);
            self.drain = None;
            warn!(
                remaining,
                "EE_MOVES took over {:?}, ignoring unread bytes", self.policy.ceiling
            );
            return Some(Inbound::DrainFinished {
                discarded,
                complete: false,
            });
        }

        None
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.drain.is_some() {
            // Ok(None) while draining means "call again with more data"
            return Ok(self.continue_drain(src));
        }

        loop {
            match src.iter().position(|&b| is_frame_start(b)) {
                Some(0) => {}
                Some(skip) => {
                    trace!("skipping {} bytes before frame start: {}", skip, HexBytes(&src[..skip]));
                    src.advance(skip);
                }
                None => {
                    if !src.is_empty() {
                        trace!("skipping {} bytes without frame start", src.len());
                        src.clear();
                    }
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            if let Some(pos) = src[1..HEADER_LEN].iter().position(|&b| is_frame_start(b)) {
                warn!(
                    "frame start inside header of message 0x{:02x}, restarting at {}",
                    src[0],
                    HexBytes(&src[pos + 1..HEADER_LEN])
                );
                src.advance(pos + 1);
                continue;
            }

            let id = src[0];
            let declared = ((src[1] as usize) << 7) | src[2] as usize;
            let payload_len = declared.checked_sub(HEADER_LEN);

            let payload_len = match payload_len {
                Some(len) if len > 0 && len <= MAX_PAYLOAD_LEN => len,
                Some(len) if id == self.policy.message_id && len == self.policy.length => {
                    warn!("EE_MOVES sent unasked, receiving and ignoring {} bytes", len);
                    src.advance(HEADER_LEN);
                    self.drain = Some(Drain {
                        remaining: len,
                        discarded: 0,
                        started: Instant::now(),
                    });
                    return Ok(Some(Inbound::DrainStarted { bytes: len }));
                }
                _ => {
                    warn!(
                        "illegal length in message header 0x{:02x} length: {}",
                        id,
                        declared as isize - HEADER_LEN as isize
                    );
                    src.advance(1);
                    continue;
                }
            };

            let total = HEADER_LEN + payload_len;
            let available = src.len().min(total);
            if let Some(pos) = src[HEADER_LEN..available]
                .iter()
                .position(|&b| is_frame_start(b))
            {
                warn!(
                    "illegal data in message 0x{:02x}, ignoring collected data {}",
                    id,
                    HexBytes(&src[HEADER_LEN..HEADER_LEN + pos])
                );
                src.advance(HEADER_LEN + pos);
                continue;
            }

            if src.len() < total {
                return Ok(None);
            }

            let bytes = src.split_to(total);
            trace!("board get: {}", HexBytes(&bytes));
            return Ok(Some(Inbound::Frame(Frame {
                id,
                payload: bytes[HEADER_LEN..].to_vec(),
            })));
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    /// An unencodable command fails with [`Error::Encode`] and leaves `dst`
    /// untouched.
    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.encode()?;
        trace!("board put: {}", HexBytes(&bytes));
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
