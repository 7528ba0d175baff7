//! Pull-based frame decoder.
//!
//! The decoder never touches I/O. Its driver asks how many bytes the next
//! step needs, obtains exactly that many, and hands them back:
//!
//! 1. `MetadataLength`: 2 bytes
//! 2. `Metadata(N)`: N bytes (skipped when N = 0)
//! 3. `PayloadLength`: 4 bytes, range-checked on arrival
//! 4. `Payload(M)`: M bytes (skipped when M = 0)
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use peerwire::protocol::{encode_message, FrameDecoder, Message};
//!
//! let wire = Bytes::from(encode_message(&Message::new(&b"hi"[..], &b"m"[..])).unwrap());
//! let mut decoder = FrameDecoder::new();
//! let mut offset = 0;
//! let message = loop {
//!     let need = decoder.bytes_needed();
//!     let chunk = wire.slice(offset..offset + need);
//!     offset += need;
//!     if let Some(msg) = decoder.advance(chunk).unwrap() {
//!         break msg;
//!     }
//! };
//! assert_eq!(message.payload(), b"hi");
//! ```

use bytes::Bytes;

use super::wire_format::{
    decode_metadata_length, decode_payload_length, MAX_PAYLOAD_SIZE, METADATA_LENGTH_SIZE,
    PAYLOAD_LENGTH_SIZE,
};
use super::Message;
use crate::error::{PeerwireError, Result};

/// The read the decoder is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// Waiting for the 2-byte metadata length.
    MetadataLength,
    /// Waiting for N metadata bytes.
    Metadata(usize),
    /// Waiting for the 4-byte payload length.
    PayloadLength,
    /// Waiting for M payload bytes.
    Payload(usize),
}

impl DecodeStep {
    /// Exact number of bytes this step consumes.
    #[inline]
    pub fn byte_count(&self) -> usize {
        match self {
            DecodeStep::MetadataLength => METADATA_LENGTH_SIZE,
            DecodeStep::Metadata(n) => *n,
            DecodeStep::PayloadLength => PAYLOAD_LENGTH_SIZE,
            DecodeStep::Payload(m) => *m,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DecodeStep::MetadataLength => "MetadataLength",
            DecodeStep::Metadata(_) => "Metadata",
            DecodeStep::PayloadLength => "PayloadLength",
            DecodeStep::Payload(_) => "Payload",
        }
    }
}

/// Step-wise decoder for one frame at a time.
#[derive(Debug)]
pub struct FrameDecoder {
    step: DecodeStep,
    metadata: Bytes,
    max_payload_size: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing `MAX_PAYLOAD_SIZE`.
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Create a decoder with a tighter payload ceiling.
    ///
    /// Values above `MAX_PAYLOAD_SIZE` are clamped to it.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            step: DecodeStep::MetadataLength,
            metadata: Bytes::new(),
            max_payload_size: max_payload_size.min(MAX_PAYLOAD_SIZE),
        }
    }

    #[inline]
    pub fn step(&self) -> DecodeStep {
        self.step
    }

    /// Bytes the next call to [`advance`](Self::advance) must receive.
    #[inline]
    pub fn bytes_needed(&self) -> usize {
        self.step.byte_count()
    }

    /// True when no part of a frame has been consumed yet.
    #[inline]
    pub fn is_at_frame_boundary(&self) -> bool {
        self.step == DecodeStep::MetadataLength
    }

    /// Feed exactly `bytes_needed()` bytes.
    ///
    /// Returns `Ok(Some(message))` when a frame completes, `Ok(None)` when
    /// another step is pending.
    ///
    /// # Errors
    ///
    /// `CorruptMessage` if the payload length is negative or above the
    /// ceiling; the decoder resets and nothing further is consumed for that
    /// frame. `Unknown` if the chunk length does not match the step.
    pub fn advance(&mut self, chunk: Bytes) -> Result<Option<Message>> {
        let expected = self.bytes_needed();
        if chunk.len() != expected {
            return Err(PeerwireError::Unknown(format!(
                "{} step needs {} bytes, got {}",
                self.step.name(),
                expected,
                chunk.len()
            )));
        }

        match self.step {
            DecodeStep::MetadataLength => {
                let len = decode_metadata_length([chunk[0], chunk[1]]);
                self.step = if len == 0 {
                    self.metadata = Bytes::new();
                    DecodeStep::PayloadLength
                } else {
                    DecodeStep::Metadata(len)
                };
                Ok(None)
            }
            DecodeStep::Metadata(_) => {
                self.metadata = chunk;
                self.step = DecodeStep::PayloadLength;
                Ok(None)
            }
            DecodeStep::PayloadLength => {
                let len = match decode_payload_length(
                    [chunk[0], chunk[1], chunk[2], chunk[3]],
                    self.max_payload_size,
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                };
                if len == 0 {
                    return Ok(Some(self.finish(Bytes::new())));
                }
                self.step = DecodeStep::Payload(len);
                Ok(None)
            }
            DecodeStep::Payload(_) => Ok(Some(self.finish(chunk))),
        }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.step = DecodeStep::MetadataLength;
        self.metadata = Bytes::new();
    }

    fn finish(&mut self, payload: Bytes) -> Message {
        let metadata = std::mem::take(&mut self.metadata);
        self.step = DecodeStep::MetadataLength;
        Message::new(payload, metadata)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
