//! Wire format encoding and decoding.
//!
//! One message on the wire:
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ Metadata len │ Metadata     │ Payload len  │ Payload      │
//! │ 2 bytes      │ N bytes      │ 4 bytes      │ M bytes      │
//! │ int16 LE     │              │ int32 LE     │ (if M > 0)   │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The metadata length is read
//! back as unsigned so the whole 0..=65535 range survives a round trip.

use crate::error::{PeerwireError, Result};

/// Size of the metadata length field.
pub const METADATA_LENGTH_SIZE: usize = 2;

/// Size of the payload length field.
pub const PAYLOAD_LENGTH_SIZE: usize = 4;

/// Largest payload a frame may carry (10,000,000 bytes).
pub const MAX_PAYLOAD_SIZE: usize = 10_000_000;

/// Largest metadata block a frame may carry.
pub const MAX_METADATA_SIZE: usize = u16::MAX as usize;

/// Check both lengths against their field ranges.
///
/// Called before anything is written; oversize values are rejected, never
/// truncated.
pub fn validate_lengths(payload_len: usize, metadata_len: usize) -> Result<()> {
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(PeerwireError::CorruptMessage(format!(
            "Payload size {} exceeds maximum {}",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    if metadata_len > MAX_METADATA_SIZE {
        return Err(PeerwireError::CorruptMessage(format!(
            "Metadata size {} exceeds maximum {}",
            metadata_len, MAX_METADATA_SIZE
        )));
    }
    Ok(())
}

/// Encode the metadata length field.
pub fn encode_metadata_length(len: usize) -> Result<[u8; METADATA_LENGTH_SIZE]> {
    let len = u16::try_from(len).map_err(|_| {
        PeerwireError::CorruptMessage(format!(
            "Metadata size {} exceeds maximum {}",
            len, MAX_METADATA_SIZE
        ))
    })?;
    Ok(len.to_le_bytes())
}

/// Decode the metadata length field.
#[inline]
pub fn decode_metadata_length(buf: [u8; METADATA_LENGTH_SIZE]) -> usize {
    u16::from_le_bytes(buf) as usize
}

/// Encode the payload length field.
pub fn encode_payload_length(len: usize) -> Result<[u8; PAYLOAD_LENGTH_SIZE]> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(PeerwireError::CorruptMessage(format!(
            "Payload size {} exceeds maximum {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    // MAX_PAYLOAD_SIZE < i32::MAX, so the cast is lossless.
    Ok((len as i32).to_le_bytes())
}

/// Decode and range-check the payload length field.
///
/// Rejects negative values and values above `max_payload_size` before the
/// caller reads or allocates anything for the payload.
pub fn decode_payload_length(
    buf: [u8; PAYLOAD_LENGTH_SIZE],
    max_payload_size: usize,
) -> Result<usize> {
    let declared = i32::from_le_bytes(buf);
    if declared < 0 {
        return Err(PeerwireError::CorruptMessage(format!(
            "Negative payload size {}",
            declared
        )));
    }
    let declared = declared as usize;
    if declared > max_payload_size {
        return Err(PeerwireError::CorruptMessage(format!(
            "Payload size {} exceeds maximum {}",
            declared, max_payload_size
        )));
    }
    Ok(declared)
}
