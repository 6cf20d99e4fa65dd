//! NDJSON codec for agent command streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving agent cannot make the engine buffer an unbounded message.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum line length accepted from an agent: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec for agent streams.
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] are discarded up to their
/// newline and decoding resumes with the next line. Only I/O errors reach
/// the caller, as [`AppError::Io`].
#[derive(Debug)]
pub struct AgentCodec(LinesCodec);

impl AgentCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }

    fn next_line(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<String>> {
        loop {
            let decoded = if eof {
                self.0.decode_eof(src)
            } else {
                self.0.decode(src)
            };
            match decoded {
                Ok(line) => return Ok(line),
                // `FramedRead` ends the stream after any decoder error, so the
                // oversized line is dropped here instead.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(limit = MAX_LINE_BYTES, "agent line too long, discarding");
                }
                Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
            }
        }
    }
}

impl Default for AgentCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AgentCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_line(src, true)
    }
}
