//! Socket wire framing: binary data, JSON data, and marked control events.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::{Result, TandemError};
use crate::transport::WireMessage;

/// Field that marks a text frame as a control event
pub const CUSTOM_EVENT_MARKER: &str = "_channelEngineCustomEvent";

/// Control event name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Control {
    /// Negotiated socket acknowledged by the accepting side
    Received,
    /// Transaction metadata from the writer
    Metadata,
    /// Reader has accepted the metadata
    TransactionReady,
    /// Channel announces a new transaction label
    Transaction,
    /// Pause the transaction
    Pause,
    /// Resume the transaction
    Resume,
    /// Reader canceled; payload is the reason
    Cancel,
    /// Writer aborted; payload is `{name, message}`
    Abort,
    /// Reader queue is over its high-water mark
    BufferFull,
    /// Reader queue has room again
    Pull,
    /// Application-defined event
    Custom(String),
}

impl Control {
    /// Wire name
    pub fn name(&self) -> &str {
        match self {
            Self::Received => "__received",
            Self::Metadata => "metadata",
            Self::TransactionReady => "__transaction-ready",
            Self::Transaction => "__transaction",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Abort => "abort",
            Self::BufferFull => "buffer-full",
            Self::Pull => "pull",
            Self::Custom(name) => name,
        }
    }

    /// Parse a wire name
    pub fn from_name(name: &str) -> Self {
        match name {
            "__received" => Self::Received,
            "metadata" => Self::Metadata,
            "__transaction-ready" => Self::TransactionReady,
            "__transaction" => Self::Transaction,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "cancel" => Self::Cancel,
            "abort" => Self::Abort,
            "buffer-full" => Self::BufferFull,
            "pull" => Self::Pull,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Named control event with a JSON payload
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEvent {
    /// Event name
    pub control: Control,
    /// Payload (`null` when absent)
    pub payload: Value,
}

impl ControlEvent {
    /// Create a control event
    pub fn new(control: Control, payload: Value) -> Self {
        Self { control, payload }
    }
}

/// Application data
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Raw bytes
    Binary(Bytes),
    /// Parsed JSON
    Json(Value),
}

impl Message {
    /// Binary payload, if this is one
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(data) => Some(data),
            Self::Json(_) => None,
        }
    }
}

/// Decoded socket frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Application data
    Data(Message),
    /// Control event
    Control(ControlEvent),
}

impl Frame {
    /// Decode a wire message
    pub fn decode(message: WireMessage) -> Result<Self> {
        let text = match message {
            WireMessage::Binary(data) => return Ok(Self::Data(Message::Binary(data))),
            WireMessage::Text(text) => text,
        };

        let value: Value = serde_json::from_str(&text)?;
        let Value::Object(mut object) = value else {
            return Ok(Self::Data(Message::Json(value)));
        };

        if !object.contains_key(CUSTOM_EVENT_MARKER) {
            return Ok(Self::Data(Message::Json(Value::Object(object))));
        }

        let name = match object.remove("event") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(TandemError::Protocol(
                    "control event without an event name".to_string(),
                ))
            },
        };
        let payload = object.remove("payload").unwrap_or(Value::Null);

        Ok(Self::Control(ControlEvent::new(Control::from_name(&name), payload)))
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<WireMessage> {
        match self {
            Self::Data(Message::Binary(data)) => Ok(WireMessage::Binary(data.clone())),
            Self::Data(Message::Json(value)) => Ok(WireMessage::Text(serde_json::to_string(value)?)),
            Self::Control(event) => {
                let mut object = Map::new();
                object.insert(CUSTOM_EVENT_MARKER.to_string(), Value::Bool(true));
                object.insert("event".to_string(), Value::String(event.control.name().to_string()));
                if !event.payload.is_null() {
                    object.insert("payload".to_string(), event.payload.clone());
                }
                Ok(WireMessage::Text(serde_json::to_string(&object)?))
            },
        }
    }

    /// Size of the binary payload, if any
    pub fn binary_len(&self) -> Option<usize> {
        match self {
            Self::Data(Message::Binary(data)) => Some(data.len()),
            _ => None,
        }
    }
}
