//! RecordIO framing of the subscription stream.
//!
//! Each record is `<decimal length>\n<payload>`. Records may be split across
//! or packed into arbitrary transport chunks.

use bytes::{Buf, Bytes, BytesMut};

use super::TransportError;

/// Longest accepted length prefix, in digits.
const MAX_PREFIX_DIGITS: usize = 20;

/// Incremental RecordIO decoder.
#[derive(Debug)]
pub struct RecordIoDecoder {
    buf: BytesMut,
    max_record: usize,
}

impl Default for RecordIoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Self::with_max_record(64 * 1024 * 1024)
    }

    pub fn with_max_record(max_record: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_record,
        }
    }

    /// Append a chunk received from the wire.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, TransportError> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_PREFIX_DIGITS {
                return Err(TransportError::Framing(
                    "length prefix too long".to_string(),
                ));
            }
            return Ok(None);
        };

        let prefix = std::str::from_utf8(&self.buf[..newline])
            .map_err(|_| TransportError::Framing("non-ascii length prefix".to_string()))?;
        let len: usize = prefix
            .trim()
            .parse()
            .map_err(|_| TransportError::Framing(format!("invalid length prefix {prefix:?}")))?;

        if len > self.max_record {
            return Err(TransportError::Framing(format!(
                "record of {len} bytes exceeds limit of {}",
                self.max_record
            )));
        }

        if self.buf.len() < newline + 1 + len {
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Frame a single record.
pub fn encode_record(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(payload);
    out.freeze()
}
