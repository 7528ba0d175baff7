//! Handshake tokens.
//!
//! The accepting side speaks first with `APPSERVICEV<version>`, the
//! initiating side answers with `APPCLIENTV<version>`. Tokens travel as raw
//! ASCII with no length prefix; each side knows how many bytes to expect.

use bytes::Bytes;

/// Protocol version spoken by default.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 1;

const SERVICE_TOKEN_PREFIX: &str = "APPSERVICEV";
const CLIENT_TOKEN_PREFIX: &str = "APPCLIENTV";

/// The token pair for one protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTokens {
    version: u32,
    service: Bytes,
    client: Bytes,
}

impl HandshakeTokens {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            service: Bytes::from(format!("{}{}", SERVICE_TOKEN_PREFIX, version)),
            client: Bytes::from(format!("{}{}", CLIENT_TOKEN_PREFIX, version)),
        }
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Token sent by the accepting side.
    #[inline]
    pub fn service_token(&self) -> &Bytes {
        &self.service
    }

    /// Token sent back by the initiating side.
    #[inline]
    pub fn client_token(&self) -> &Bytes {
        &self.client
    }
}

impl Default for HandshakeTokens {
    fn default() -> Self {
        Self::new(DEFAULT_PROTOCOL_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        let tokens = HandshakeTokens::new(1);
        assert_eq!(&tokens.service_token()[..], b"APPSERVICEV1");
        assert_eq!(&tokens.client_token()[..], b"APPCLIENTV1");
    }

    #[test]
    fn test_tokens_distinct() {
        let tokens = HandshakeTokens::default();
        assert_ne!(tokens.service_token(), tokens.client_token());
        assert_eq!(tokens.version(), DEFAULT_PROTOCOL_VERSION);
    }

    #[test]
    fn test_versions_do_not_match() {
        assert_ne!(
            HandshakeTokens::new(1).client_token(),
            HandshakeTokens::new(2).client_token()
        );
        assert_eq!(&HandshakeTokens::new(42).service_token()[..], b"APPSERVICEV42");
    }
}
