//! MessagePack codec for SignalR frames.
//!
//! Each message on the wire is a VarInt length prefix followed by a
//! MessagePack array. A single WebSocket frame may carry several messages.

use serde_json::{json, Map, Number, Value};
use tracing::{debug, warn};

use crate::protocol::frame::{kind, Frame};

/// Completion result kinds.
const RESULT_ERROR: u64 = 1;
const RESULT_VOID: u64 = 2;
const RESULT_VALUE: u64 = 3;

/// MessagePack extension type of timestamps.
const TIMESTAMP_EXT: i8 = -1;

/// A length prefix never spans more than five bytes.
const MAX_LENGTH_PREFIX: usize = 5;

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Failed to encode a frame to MessagePack.
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode MessagePack data.
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// The handshake response was not valid JSON.
    #[error("Invalid handshake response: {0}")]
    InvalidHandshakeResponse(#[from] serde_json::Error),

    /// The handshake response has no record separator.
    #[error("Incomplete handshake response")]
    IncompleteHandshake,

    /// A message does not conform to the hub protocol.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Received a message type not recognized by this implementation.
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u64),

    /// The buffer ended inside a message.
    #[error("Message truncated")]
    Truncated,
}

/// Codec for the SignalR MessagePack hub protocol.
pub struct MessagePackCodec;

impl MessagePackCodec {
    /// Encodes a [`Frame`] as a length-prefixed MessagePack message.
    pub fn encode(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        let body = rmp_serde::to_vec(&Self::to_array(frame))?;
        let mut buf = Vec::with_capacity(body.len() + MAX_LENGTH_PREFIX);
        write_length(&mut buf, body.len());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decodes every message contained in `data`.
    ///
    /// Messages of unknown type are skipped, and so are malformed ones whose
    /// length prefix is intact.
    pub fn decode(data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let (length, prefix) = read_length(rest)?;
            let end = prefix.checked_add(length).ok_or(ProtocolError::Truncated)?;
            if rest.len() < end {
                return Err(ProtocolError::Truncated);
            }
            match Self::decode_message(&rest[prefix..end]) {
                Ok(frame) => frames.push(frame),
                Err(ProtocolError::UnexpectedMessageType(message_type)) => {
                    debug!(message_type, "Skipping unsupported hub message");
                }
                Err(e) => warn!(error = %e, length, "Skipping malformed hub message"),
            }
            rest = &rest[end..];
        }

        Ok(frames)
    }

    /// Decodes a single MessagePack message body (without length prefix).
    pub fn decode_message(body: &[u8]) -> Result<Frame, ProtocolError> {
        let array: Vec<Value> = match rmpv::decode::read_value(&mut &body[..])? {
            rmpv::Value::Array(items) => items.into_iter().map(to_json).collect(),
            _ => return Err(ProtocolError::InvalidMessage("message is not an array")),
        };

        let message_type = array
            .first()
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::InvalidMessage("missing message type"))?;

        match message_type {
            kind::INVOCATION => {
                // [1, headers, invocationId, target, [arguments], [streamIds]?]
                if array.len() < 5 {
                    return Err(ProtocolError::InvalidMessage("invocation too short"));
                }
                Ok(Frame::Invocation {
                    invocation_id: optional_string(&array[2])?,
                    target: required_string(&array[3])?,
                    arguments: values(&array[4])?,
                    stream_ids: stream_ids(array.get(5))?,
                })
            }
            kind::STREAM_ITEM => {
                // [2, headers, invocationId, item]
                if array.len() != 4 {
                    return Err(ProtocolError::InvalidMessage("malformed stream item"));
                }
                Ok(Frame::StreamItem {
                    invocation_id: required_string(&array[2])?,
                    item: array[3].clone(),
                })
            }
            kind::COMPLETION => {
                // [3, headers, invocationId, resultKind, result?]
                if array.len() < 4 {
                    return Err(ProtocolError::InvalidMessage("completion too short"));
                }
                let invocation_id = required_string(&array[2])?;
                let (result, error) = match array[3].as_u64() {
                    Some(RESULT_ERROR) => {
                        let error = array
                            .get(4)
                            .and_then(Value::as_str)
                            .ok_or(ProtocolError::InvalidMessage("completion without error"))?;
                        (None, Some(error.to_string()))
                    }
                    Some(RESULT_VOID) => (None, None),
                    Some(RESULT_VALUE) => {
                        let result = array
                            .get(4)
                            .cloned()
                            .ok_or(ProtocolError::InvalidMessage("completion without result"))?;
                        (Some(result), None)
                    }
                    _ => return Err(ProtocolError::InvalidMessage("unknown result kind")),
                };
                Ok(Frame::Completion {
                    invocation_id,
                    result,
                    error,
                })
            }
            kind::STREAM_INVOCATION => {
                if array.len() < 5 {
                    return Err(ProtocolError::InvalidMessage("stream invocation too short"));
                }
                Ok(Frame::StreamInvocation {
                    invocation_id: required_string(&array[2])?,
                    target: required_string(&array[3])?,
                    arguments: values(&array[4])?,
                    stream_ids: stream_ids(array.get(5))?,
                })
            }
            kind::CANCEL_INVOCATION => {
                if array.len() != 3 {
                    return Err(ProtocolError::InvalidMessage("malformed cancel invocation"));
                }
                Ok(Frame::CancelInvocation {
                    invocation_id: required_string(&array[2])?,
                })
            }
            kind::PING => Ok(Frame::Ping),
            kind::CLOSE => {
                // [7, error, allowReconnect?]
                if array.len() < 2 {
                    return Err(ProtocolError::InvalidMessage("malformed close"));
                }
                Ok(Frame::Close {
                    error: optional_string(&array[1])?,
                    allow_reconnect: array.get(2).and_then(Value::as_bool),
                })
            }
            other => Err(ProtocolError::UnexpectedMessageType(other)),
        }
    }

    fn to_array(frame: &Frame) -> Vec<Value> {
        let headers = || Value::Object(Map::new());

        match frame {
            Frame::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut array = vec![
                    kind::INVOCATION.into(),
                    headers(),
                    invocation_id.clone().map_or(Value::Null, Value::String),
                    Value::String(target.clone()),
                    Value::Array(arguments.clone()),
                ];
                if !stream_ids.is_empty() {
                    array.push(string_array(stream_ids));
                }
                array
            }
            Frame::StreamItem {
                invocation_id,
                item,
            } => vec![
                kind::STREAM_ITEM.into(),
                headers(),
                Value::String(invocation_id.clone()),
                item.clone(),
            ],
            Frame::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut array = vec![
                    kind::COMPLETION.into(),
                    headers(),
                    Value::String(invocation_id.clone()),
                ];
                match (error, result) {
                    (Some(error), _) => {
                        array.push(RESULT_ERROR.into());
                        array.push(Value::String(error.clone()));
                    }
                    (None, Some(result)) => {
                        array.push(RESULT_VALUE.into());
                        array.push(result.clone());
                    }
                    (None, None) => array.push(RESULT_VOID.into()),
                }
                array
            }
            Frame::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut array = vec![
                    kind::STREAM_INVOCATION.into(),
                    headers(),
                    Value::String(invocation_id.clone()),
                    Value::String(target.clone()),
                    Value::Array(arguments.clone()),
                ];
                if !stream_ids.is_empty() {
                    array.push(string_array(stream_ids));
                }
                array
            }
            Frame::CancelInvocation { invocation_id } => vec![
                kind::CANCEL_INVOCATION.into(),
                headers(),
                Value::String(invocation_id.clone()),
            ],
            Frame::Ping => vec![kind::PING.into()],
            Frame::Close {
                error,
                allow_reconnect,
            } => {
                let mut array = vec![
                    kind::CLOSE.into(),
                    error.clone().map_or(Value::Null, Value::String),
                ];
                if let Some(allow) = allow_reconnect {
                    array.push(Value::Bool(*allow));
                }
                array
            }
        }
    }
}

/// Converts a decoded MessagePack value into the JSON payload model.
///
/// Binary data becomes an array of bytes and timestamps become Unix
/// milliseconds. Other extension values keep their type tag and raw bytes.
fn to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => n
            .as_u64()
            .map(Value::from)
            .or_else(|| n.as_i64().map(Value::from))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(f) => float(f64::from(f)),
        rmpv::Value::F64(f) => float(f),
        rmpv::Value::String(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        rmpv::Value::Binary(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
        rmpv::Value::Array(items) => Value::Array(items.into_iter().map(to_json).collect()),
        rmpv::Value::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (map_key(key), to_json(value)))
                .collect(),
        ),
        rmpv::Value::Ext(TIMESTAMP_EXT, data) => {
            timestamp_millis(&data).map_or(Value::Null, Value::from)
        }
        rmpv::Value::Ext(tag, data) => json!({ "type": tag, "data": data }),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn map_key(key: rmpv::Value) -> String {
    match key {
        rmpv::Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        other => other.to_string(),
    }
}

/// Decodes the 32, 64 and 96 bit timestamp layouts.
fn timestamp_millis(data: &[u8]) -> Option<i64> {
    let (secs, nanos) = match data.len() {
        4 => (i64::from(u32::from_be_bytes(data.try_into().ok()?)), 0),
        8 => {
            let raw = u64::from_be_bytes(data.try_into().ok()?);
            ((raw & 0x3_ffff_ffff) as i64, (raw >> 34) as u32)
        }
        12 => {
            let nanos = u32::from_be_bytes(data[..4].try_into().ok()?);
            let secs = i64::from_be_bytes(data[4..].try_into().ok()?);
            (secs, nanos)
        }
        _ => return None,
    };
    secs.checked_mul(1000)?.checked_add(i64::from(nanos / 1_000_000))
}

fn write_length(buf: &mut Vec<u8>, mut length: usize) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if length == 0 {
            break;
        }
    }
}

/// Returns the message length and the number of prefix bytes.
fn read_length(data: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut length = 0usize;
    for (i, byte) in data.iter().take(MAX_LENGTH_PREFIX).enumerate() {
        length |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    if data.len() < MAX_LENGTH_PREFIX {
        Err(ProtocolError::Truncated)
    } else {
        Err(ProtocolError::InvalidMessage("length prefix too long"))
    }
}

fn optional_string(value: &Value) -> Result<Option<String>, ProtocolError> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Null => Ok(None),
        _ => Err(ProtocolError::InvalidMessage("expected string or nil")),
    }
}

fn required_string(value: &Value) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(ProtocolError::InvalidMessage("expected string"))
}

fn values(value: &Value) -> Result<Vec<Value>, ProtocolError> {
    value
        .as_array()
        .cloned()
        .ok_or(ProtocolError::InvalidMessage("expected argument array"))
}

fn stream_ids(value: Option<&Value>) -> Result<Vec<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids.iter().map(required_string).collect(),
        Some(_) => Err(ProtocolError::InvalidMessage("expected stream id array")),
    }
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}
