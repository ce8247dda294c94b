//! Handshake messages.
//!
//! The handshake is always JSON, whatever hub protocol is negotiated, and
//! each message is terminated by the ASCII record separator `0x1E`.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Sent by the client right after the WebSocket is established.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn messagepack() -> Self {
        Self {
            protocol: "messagepack".to_string(),
            version: 1,
        }
    }

    /// Serializes the request followed by the record separator.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let mut text = serde_json::to_string(self)?;
        text.push(RECORD_SEPARATOR as char);
        Ok(text)
    }
}

/// Server answer to the handshake request. An empty object means success.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Parses the response at the start of `data`.
    ///
    /// Returns the response and the bytes that followed the separator; the
    /// server may pack its first hub messages into the same frame.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let end = data
            .iter()
            .position(|b| *b == RECORD_SEPARATOR)
            .ok_or(ProtocolError::IncompleteHandshake)?;
        let response = serde_json::from_slice(&data[..end])?;
        Ok((response, &data[end + 1..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_text() {
        let text = HandshakeRequest::messagepack().to_text().unwrap();
        assert_eq!(text, "{\"protocol\":\"messagepack\",\"version\":1}\u{1e}");
    }

    #[test]
    fn test_response_with_trailing_messages() {
        let data = b"{}\x1e\x02\x91\x06";
        let (response, rest) = HandshakeResponse::parse(data).unwrap();
        assert!(response.error.is_none());
        assert_eq!(rest, &[0x02, 0x91, 0x06]);
    }

    #[test]
    fn test_response_with_error() {
        let data = b"{\"error\":\"Requested protocol 'messagepack' is not available.\"}\x1e";
        let (response, rest) = HandshakeResponse::parse(data).unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some("Requested protocol 'messagepack' is not available.")
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_response_without_separator() {
        assert!(matches!(
            HandshakeResponse::parse(b"{}"),
            Err(ProtocolError::IncompleteHandshake)
        ));
    }
}
