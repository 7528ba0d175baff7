//! Codec module - typed encoding for message payloads and metadata.
//!
//! The framing layer treats payload and metadata as opaque bytes. When both
//! peers agree to carry structured values, [`MsgPackCodec`] turns them into
//! those bytes and back. [`Message::from_serializable`] and friends are thin
//! wrappers over it.
//!
//! [`Message::from_serializable`]: crate::protocol::Message::from_serializable
//!
//! # Example
//!
//! ```
//! use peerwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&("ping", 3u8)).unwrap();
//! let decoded: (String, u8) = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, ("ping".to_string(), 3));
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
