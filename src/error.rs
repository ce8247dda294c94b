use std::sync::Arc;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors that can occur in the hub facade or the underlying connection.
///
/// The type is `Clone` so a single failure can be broadcast to every
/// observer of a stream; sources that are not `Clone` are kept behind `Arc`.
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// The operation needs a connection handle and none has been created yet.
    #[error("Hub connection has not been started")]
    NotStarted,

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request failed: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    #[error("Protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("Negotiation failed: {0}")]
    Negotiate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Invalid header `{0}`")]
    InvalidHeader(String),

    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Server timeout elapsed without receiving a message")]
    ServerTimeout,

    /// Error completion returned by the hub for an invocation or stream.
    #[error("Server error: {0}")]
    Server(String),

    /// The caller-supplied upload stream failed.
    #[error("Stream source failed: {0}")]
    Source(String),

    #[error("Operation was dropped before it completed")]
    Canceled,
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Arc::new(err))
    }
}

impl From<ProtocolError> for HubError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(Arc::new(err))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(err))
    }
}
