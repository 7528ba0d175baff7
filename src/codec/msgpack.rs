//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written in map form (`to_vec_named`) so a peer can
//! decode them by field name without sharing field order.
//!
//! # Example
//!
//! ```
//! use peerwire::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Greeting {
//!     from: String,
//!     seq: u32,
//! }
//!
//! let greeting = Greeting { from: "service".to_string(), seq: 1 };
//! let encoded = MsgPackCodec::encode(&greeting).unwrap();
//! let decoded: Greeting = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, greeting);
//! ```

use crate::error::Result;

/// MessagePack codec for structured payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    ///
    /// # Errors
    ///
    /// `MsgPackEncode` if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// `MsgPackDecode` if the bytes do not describe a `T`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
