//! Inbound frame reassembly and decompression
//!
//! With `compress=zlib-stream` the gateway keeps ONE deflate stream open for
//! the whole connection and terminates every message with a sync flush
//! (`00 00 FF FF`). A message may span several binary frames. The inflate
//! context therefore lives as long as the connection; it is rebuilt only when
//! the session reconnects.

use super::payload::Envelope;
use crate::error::ProtocolError;
use flate2::{Decompress, FlushDecompress, Status};

/// Trailing bytes of a zlib sync flush
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const INITIAL_OUTPUT_CAPACITY: usize = 32 * 1024;

/// Per-connection frame decoder. Owned by exactly one session.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            inflater: Decompress::new(true),
        }
    }

    /// Uncompressed text frame: always one complete message.
    pub fn push_text(&mut self, text: &str) -> Result<Envelope, ProtocolError> {
        Envelope::parse(text.as_bytes())
    }

    /// Append a binary chunk. Returns `Ok(None)` until the buffered bytes end
    /// with [`ZLIB_SUFFIX`].
    pub fn push_binary(&mut self, chunk: &[u8]) -> Result<Option<Envelope>, ProtocolError> {
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let inflated = self.inflate();
        self.buffer.clear();
        let text = String::from_utf8(inflated?).map_err(|_| ProtocolError::Utf8)?;
        Envelope::parse(text.as_bytes()).map(Some)
    }

    /// Bytes waiting for the rest of a message
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the partial buffer and start a fresh inflate stream (new connection).
    pub fn reset(&mut self) {
        self.buffer = Vec::new();
        self.inflater.reset(true);
    }

    fn inflate(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity((self.buffer.len() * 4).max(INITIAL_OUTPUT_CAPACITY));
        let mut consumed = 0usize;

        loop {
            let before = self.inflater.total_in();
            let status = self
                .inflater
                .decompress_vec(&self.buffer[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| ProtocolError::Inflate(e.to_string()))?;
            consumed += (self.inflater.total_in() - before) as usize;

            // Spare output capacity left means zlib drained all the input it could.
            if out.len() < out.capacity() || status == Status::StreamEnd {
                break;
            }
            out.reserve(out.capacity());
        }

        if consumed < self.buffer.len() {
            return Err(ProtocolError::Inflate(format!(
                "{} trailing bytes were not consumed",
                self.buffer.len() - consumed
            )));
        }
        Ok(out)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
