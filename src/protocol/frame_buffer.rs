//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and drives a
//! [`FrameDecoder`] over whatever chunks arrive, so the messages produced do
//! not depend on how the stream was fragmented.
//!
//! # Example
//!
//! ```
//! use peerwire::protocol::{encode_message, FrameBuffer, Message};
//!
//! let wire = encode_message(&Message::new(&b"hello"[..], &b""[..])).unwrap();
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&wire[..3]).unwrap().is_empty());
//! let messages = buffer.push(&wire[3..]).unwrap();
//! assert_eq!(messages[0].payload(), b"hello");
//! ```

use bytes::BytesMut;

use super::decoder::{DecodeStep, FrameDecoder};
use super::wire_format::MAX_PAYLOAD_SIZE;
use super::Message;
use crate::error::Result;

/// Buffer for accumulating incoming bytes and extracting complete messages.
pub struct FrameBuffer {
    /// Accumulated bytes not yet consumed by the decoder.
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: `MAX_PAYLOAD_SIZE`.
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with a custom payload ceiling.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            decoder: FrameDecoder::with_max_payload(max_payload_size),
        }
    }

    /// Push data into the buffer and extract all complete messages.
    ///
    /// Partial frames stay buffered for the next push.
    ///
    /// # Errors
    ///
    /// `CorruptMessage` if a payload length is out of range. Bytes after the
    /// offending length field stay in the buffer untouched.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Message>> {
        loop {
            let need = self.decoder.bytes_needed();
            if self.buffer.len() < need {
                return Ok(None);
            }
            let chunk = self.buffer.split_to(need).freeze();
            if let Some(message) = self.decoder.advance(chunk)? {
                return Ok(Some(message));
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True if a frame has been partially consumed.
    pub fn has_partial_frame(&self) -> bool {
        !self.decoder.is_at_frame_boundary() || !self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.decoder.reset();
    }

    #[cfg(test)]
    fn step(&self) -> DecodeStep {
        self.decoder.step()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerwireError;
    use crate::protocol::encode_message;

    fn wire(payload: &[u8], metadata: &[u8]) -> Vec<u8> {
        encode_message(&Message::new(payload.to_vec(), metadata.to_vec())).unwrap()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let messages = buffer.push(&wire(b"hello", b"m")).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload(), b"hello");
        assert_eq!(messages[0].metadata(), b"m");
        assert!(buffer.is_empty());
        assert!(!buffer.has_partial_frame());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = wire(b"first", b"1");
        combined.extend(wire(b"", b"2"));
        combined.extend(wire(b"third", b""));

        let messages = buffer.push(&combined).unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].payload(), b"first");
        assert!(messages[1].payload().is_empty());
        assert_eq!(messages[1].metadata(), b"2");
        assert_eq!(messages[2].payload(), b"third");
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let bytes = wire(payload, b"");

        let split = 2 + 4 + 10;
        assert!(buffer.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(buffer.step(), DecodeStep::Payload(payload.len()));

        let messages = buffer.push(&bytes[split..]).unwrap();
        assert_eq!(messages[0].payload(), payload);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let bytes = wire(b"hi", b"meta");

        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(all, vec![Message::new(&b"hi"[..], &b"meta"[..])]);
    }

    #[test]
    fn test_oversize_length_consumes_no_payload() {
        let mut buffer = FrameBuffer::new();
        let mut bytes = vec![0, 0];
        bytes.extend_from_slice(&((MAX_PAYLOAD_SIZE + 1) as i32).to_le_bytes());
        bytes.extend_from_slice(b"trailing");

        let result = buffer.push(&bytes);

        assert!(matches!(result, Err(PeerwireError::CorruptMessage(_))));
        assert_eq!(buffer.len(), b"trailing".len());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let bytes = wire(b"test", b"");
        buffer.push(&bytes[..3]).unwrap();
        assert!(buffer.has_partial_frame());

        buffer.clear();

        assert_eq!(buffer.step(), DecodeStep::MetadataLength);
        assert!(buffer.is_empty());
    }
}
