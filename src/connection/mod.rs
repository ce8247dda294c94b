//! Hub connection contract and its WebSocket implementation.
//!
//! The [`Hub`](crate::Hub) facade only talks to a connection through the
//! [`HubConnection`] trait. [`create_connection`] builds the default
//! implementation, [`WebSocketConnection`], which speaks the MessagePack hub
//! protocol over WebSocket.

pub mod bus;
mod websocket;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

use crate::error::HubError;
use crate::options::HubOptions;

pub use websocket::WebSocketConnection;

/// Callback receiving the arguments of a server-to-client invocation.
pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Callback receiving the error that closed the connection, if any.
pub type CloseHandler = Arc<dyn Fn(Option<HubError>) + Send + Sync>;

/// Items of a server-to-client stream. Dropping it cancels the stream.
pub type ItemStream = BoxStream<'static, Result<Value, HubError>>;

/// Items of a client-to-server stream. An `Err` ends the upload with that
/// message.
pub type UploadStream = BoxStream<'static, Result<Value, String>>;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A real-time hub connection, driven imperatively.
///
/// Implementations must be cheap to share behind an `Arc`; every method
/// takes `&self`.
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Opens the connection.
    async fn start(&self) -> Result<(), HubError>;

    /// Closes the connection. Close handlers run with `None`.
    async fn stop(&self) -> Result<(), HubError>;

    /// Adds a handler for the server-to-client method `event`.
    ///
    /// Event names match case-insensitively.
    fn on(&self, event: &str, handler: EventHandler);

    /// Removes every handler for `event`, whatever its case.
    fn off(&self, event: &str);

    /// Adds a handler called whenever the connection closes.
    fn on_close(&self, handler: CloseHandler);

    /// Invokes a hub method without waiting for its result.
    async fn send(&self, method: &str, args: Vec<Value>) -> Result<(), HubError>;

    /// Invokes a hub method and waits for its result.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError>;

    /// Opens a server-to-client stream.
    async fn stream(&self, method: &str, args: Vec<Value>) -> Result<ItemStream, HubError>;

    /// Sends `items` to the hub method as a client-to-server stream.
    ///
    /// Resolves once the upload has completed. Fails with
    /// [`HubError::Source`] when `items` yields an error.
    async fn send_stream(
        &self,
        method: &str,
        args: Vec<Value>,
        items: UploadStream,
    ) -> Result<(), HubError>;
}

/// Builds a new, not yet started connection to `url`.
///
/// No network activity happens until [`HubConnection::start`].
pub fn create_connection(url: &str, options: &HubOptions) -> Arc<dyn HubConnection> {
    Arc::new(WebSocketConnection::new(url, options.clone()))
}
