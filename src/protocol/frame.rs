//! SignalR hub protocol messages.
//!
//! This module defines the [`Frame`] enum covering the message types of the
//! ASP.NET Core SignalR hub protocol (v1) that this client exchanges.
//!
//! For details, see the [hub protocol documentation](https://github.com/dotnet/aspnetcore/blob/main/src/SignalR/docs/specs/HubProtocol.md).

use serde_json::Value;

/// Message type tags as they appear on the wire.
pub(crate) mod kind {
    pub const INVOCATION: u64 = 1;
    pub const STREAM_ITEM: u64 = 2;
    pub const COMPLETION: u64 = 3;
    pub const STREAM_INVOCATION: u64 = 4;
    pub const CANCEL_INVOCATION: u64 = 5;
    pub const PING: u64 = 6;
    pub const CLOSE: u64 = 7;
}

/// A single hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Non-streaming method call, in either direction.
    ///
    /// Example (MessagePack): `[1, {}, null, "NewsUpdate", [{"title": "Hello"}]]`
    Invocation {
        /// Present when the caller expects a `Completion`.
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        /// Client-to-server streams passed as arguments.
        stream_ids: Vec<String>,
    },

    /// One item of a stream, in either direction.
    ///
    /// Example (MessagePack): `[2, {}, "7", 42]`
    StreamItem { invocation_id: String, item: Value },

    /// Result of an invocation, or the end of a stream.
    ///
    /// At most one of `result` and `error` is present; neither means a void
    /// result.
    ///
    /// Example (success): `[3, {}, "123", 3, "ok"]`
    /// Example (error):   `[3, {}, "123", 1, "Something failed"]`
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Client asks the server to start a server-to-client stream.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },

    /// Client cancels a server-to-client stream.
    CancelInvocation { invocation_id: String },

    /// Keep-alive, sent by either side. No response is required.
    ///
    /// Example (MessagePack): `[6]`
    Ping,

    /// Terminates the connection.
    ///
    /// Example (MessagePack): `[7, "Bye", false]`
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },
}
