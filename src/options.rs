//! Connection configuration.
//!
//! [`HubOptions`] is handed to the connection factory together with the hub
//! URL. Every field has a default, so an application can deserialize a
//! partial section of its own configuration file into it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::subject::DEFAULT_CAPACITY;

/// Time allowed for the server to answer the handshake request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// Interval between keep-alive pings sent to the server.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Silence after which the server is considered gone.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport and authentication options for a hub connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubOptions {
    /// Bearer token sent with the negotiate request and the WebSocket upgrade.
    pub access_token: Option<String>,
    /// Extra HTTP headers for the negotiate request and the WebSocket upgrade.
    pub headers: HashMap<String, String>,
    /// Connect straight to the WebSocket endpoint without `/negotiate`.
    pub skip_negotiation: bool,
    #[serde(with = "millis", rename = "handshakeTimeoutMs")]
    pub handshake_timeout: Duration,
    /// Zero disables keep-alive pings.
    #[serde(with = "millis", rename = "keepAliveIntervalMs")]
    pub keep_alive_interval: Duration,
    /// Zero disables the server timeout.
    #[serde(with = "millis", rename = "serverTimeoutMs")]
    pub server_timeout: Duration,
    /// How many values an event or notification observer may lag behind.
    pub event_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            access_token: None,
            headers: HashMap::new(),
            skip_negotiation: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            event_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl HubOptions {
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
