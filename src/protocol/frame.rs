//! Message type and frame encoding.
//!
//! A [`Message`] is an immutable `(payload, metadata)` pair. Both halves are
//! opaque `bytes::Bytes`, so cloning a message or handing it to the writer
//! task never copies the data.
//!
//! # Example
//!
//! ```
//! use peerwire::protocol::{encode_message, Message};
//!
//! let msg = Message::new(&b"hello world"[..], vec![0x00u8]);
//! let wire = encode_message(&msg).unwrap();
//! assert_eq!(&wire[..3], &[0x01, 0x00, 0x00]);
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::wire_format::{
    encode_metadata_length, encode_payload_length, validate_lengths, METADATA_LENGTH_SIZE,
    PAYLOAD_LENGTH_SIZE,
};
use crate::codec::MsgPackCodec;
use crate::error::Result;

/// One application message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    payload: Bytes,
    metadata: Bytes,
}

impl Message {
    /// Create a message from payload and metadata.
    ///
    /// Lengths are checked when the message is encoded, not here.
    pub fn new(payload: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: metadata.into(),
        }
    }

    /// Create a message with an empty metadata block.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, Bytes::new())
    }

    /// Create a message whose payload and metadata are MsgPack-encoded values.
    pub fn from_serializable<P: Serialize, M: Serialize>(payload: &P, metadata: &M) -> Result<Self> {
        let payload = MsgPackCodec::encode(payload)?;
        let metadata = MsgPackCodec::encode(metadata)?;
        Ok(Self::new(payload, metadata))
    }

    /// Decode the payload as a MsgPack value.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.payload)
    }

    /// Decode the metadata as a MsgPack value.
    pub fn decode_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.metadata)
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Cheap clone of the payload.
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Cheap clone of the metadata.
    #[inline]
    pub fn metadata_bytes(&self) -> Bytes {
        self.metadata.clone()
    }

    /// Split into `(payload, metadata)`.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.payload, self.metadata)
    }

    /// Number of bytes this message occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        METADATA_LENGTH_SIZE + self.metadata.len() + PAYLOAD_LENGTH_SIZE + self.payload.len()
    }
}

/// The four wire segments of one message, in write order.
///
/// Built by [`FrameSegments::from_message`], which performs all range checks,
/// so a value of this type is always writable.
#[derive(Debug, Clone)]
pub struct FrameSegments {
    /// Encoded metadata length (2 bytes).
    pub metadata_length: [u8; METADATA_LENGTH_SIZE],
    /// Metadata bytes.
    pub metadata: Bytes,
    /// Encoded payload length (4 bytes).
    pub payload_length: [u8; PAYLOAD_LENGTH_SIZE],
    /// Payload bytes; empty means no payload segment is written.
    pub payload: Bytes,
}

impl FrameSegments {
    /// Encode a message into its segments.
    ///
    /// # Errors
    ///
    /// `CorruptMessage` if the payload exceeds `MAX_PAYLOAD_SIZE` or the
    /// metadata exceeds `MAX_METADATA_SIZE`.
    pub fn from_message(message: &Message) -> Result<Self> {
        validate_lengths(message.payload.len(), message.metadata.len())?;
        Ok(Self {
            metadata_length: encode_metadata_length(message.metadata.len())?,
            metadata: message.metadata_bytes(),
            payload_length: encode_payload_length(message.payload.len())?,
            payload: message.payload_bytes(),
        })
    }

    /// Total size of all segments.
    #[inline]
    pub fn size(&self) -> usize {
        METADATA_LENGTH_SIZE + self.metadata.len() + PAYLOAD_LENGTH_SIZE + self.payload.len()
    }

    /// Concatenate the segments into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.metadata_length);
        buf.extend_from_slice(&self.metadata);
        buf.extend_from_slice(&self.payload_length);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Encode a message as one contiguous byte vector.
///
/// # Example
///
/// ```
/// use peerwire::protocol::{encode_message, Message};
///
/// let bytes = encode_message(&Message::new(&b"abc"[..], &b""[..])).unwrap();
/// assert_eq!(bytes, vec![0, 0, 3, 0, 0, 0, b'a', b'b', b'c']);
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    Ok(FrameSegments::from_message(message)?.to_vec())
}
