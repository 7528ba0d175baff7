//! Error types for peerwire.

use thiserror::Error;

/// Main error type for all peerwire operations.
#[derive(Debug, Error)]
pub enum PeerwireError {
    /// Catch-all for conditions that fit no other kind.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// A length field is out of range (on encode or decode).
    #[error("Corrupt message: {0}")]
    CorruptMessage(String),

    /// Send/receive attempted with no live session.
    #[error("No connection")]
    NoConnection,

    /// Token mismatch or I/O failure while exchanging handshake tokens.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer closed the stream cleanly between frames.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl PeerwireError {
    /// True for errors that came from the peer hanging up rather than from
    /// a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PeerwireError::ConnectionClosed => true,
            PeerwireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type alias using PeerwireError.
pub type Result<T> = std::result::Result<T, PeerwireError>;
