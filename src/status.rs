//! Connection status values announced by the hub facade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle value broadcast on [`Hub::status_changes`](crate::Hub::status_changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub const CONNECTED: &'static str = "connected";
    pub const DISCONNECTED: &'static str = "disconnected";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => Self::CONNECTED,
            Self::Disconnected => Self::DISCONNECTED,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Disconnected.as_str(), "disconnected");
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Connected).unwrap(),
            serde_json::json!("connected")
        );
    }
}
