//! Protocol module - wire format, framing, and handshake tokens.
//!
//! This module is pure: no I/O happens here.
//! - Length-prefixed frame encoding (`int16 | metadata | int32 | payload`)
//! - Step-wise decoder and a frame buffer for arbitrary chunking
//! - The version tokens exchanged before any frame

mod decoder;
mod frame;
mod frame_buffer;
mod handshake;
mod wire_format;

pub use decoder::{DecodeStep, FrameDecoder};
pub use frame::{encode_message, FrameSegments, Message};
pub use frame_buffer::FrameBuffer;
pub use handshake::{HandshakeTokens, DEFAULT_PROTOCOL_VERSION};
pub use wire_format::{
    decode_metadata_length, decode_payload_length, encode_metadata_length, encode_payload_length,
    validate_lengths, MAX_METADATA_SIZE, MAX_PAYLOAD_SIZE, METADATA_LENGTH_SIZE,
    PAYLOAD_LENGTH_SIZE,
};
