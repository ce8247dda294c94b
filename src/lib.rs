//! Reactive client for ASP.NET Core SignalR hubs.
//!
//! This crate exposes a hub connection as `futures` streams: start and stop
//! the connection, subscribe to server events by name, invoke hub methods
//! and push client-to-server streams, all as composable asynchronous
//! sequences instead of callbacks.
//!
//! The [`Hub`] facade works against any [`HubConnection`]. The default one,
//! [`WebSocketConnection`](connection::WebSocketConnection), speaks the
//! MessagePack hub protocol over WebSocket.
//!
//! # Quick start
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use signalrr_rx::{ConnectionStatus, Hub, HubOptions};
//!
//! # async fn example() -> Result<(), signalrr_rx::HubError> {
//! let hub = Hub::new("chat", "http://localhost:5000/chathub", HubOptions::default());
//! let mut status = hub.status_changes();
//!
//! hub.start().await?;
//! assert_eq!(status.next().await, Some(ConnectionStatus::Connected));
//!
//! let sum: i64 = hub.invoke("Add", (1, 2)).await?;
//! let mut counter = hub.stream::<u32, _>("Counter", (10, 500)).subscribe();
//! while let Some(Ok(n)) = counter.next().await {
//!     println!("{n} (sum was {sum})");
//! }
//!
//! hub.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod connection;
pub mod error;
pub mod hub;
pub mod negotiate;
pub mod options;
pub mod protocol;
pub mod shared;
pub mod status;
pub mod subject;

pub use completion::Completion;
pub use connection::{create_connection, HubConnection};
pub use error::HubError;
pub use hub::{EventStream, Hub};
pub use options::HubOptions;
pub use protocol::{Frame, MessagePackCodec, ProtocolError};
pub use shared::SharedStream;
pub use status::ConnectionStatus;
