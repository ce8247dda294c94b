//! SignalR hub protocol implementation.
//!
//! This module provides the handshake messages and the MessagePack codec
//! for the SignalR hub protocol.

mod codec;
mod frame;
mod handshake;

pub use codec::{MessagePackCodec, ProtocolError};
pub use frame::Frame;
pub use handshake::{HandshakeRequest, HandshakeResponse, RECORD_SEPARATOR};
