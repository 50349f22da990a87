//! Message envelope
//!
//! Every frame exchanged with a peer is a JSON envelope:
//!
//! ```json
//! {"type": "join_room", "data": {"room": "lobby"}}
//! ```
//!
//! Inbound data is kept as raw JSON so handlers decode only what they need,
//! and echo-style handlers can return it byte for byte. Outbound messages are
//! usually built from a structured payload, which is serialized into the raw
//! field when the message is encoded.

use crate::error::{RealtimeError, RealtimeResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{json, Value};
use std::borrow::Cow;

/// Message type sent back to a peer when one of its messages fails
pub const ERROR_MESSAGE_TYPE: &str = "error";

/// A `{type, data}` envelope
#[derive(Debug, Clone)]
pub struct Message {
    kind: String,
    data: Option<Box<RawValue>>,
    payload: Option<Value>,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Cow<'a, RawValue>>,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

impl Message {
    /// A message with no data
    pub fn new<T: Into<String>>(kind: T) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            payload: None,
        }
    }

    /// A message carrying a structured payload
    pub fn with_payload<T: Into<String>>(kind: T, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            payload: Some(payload),
        }
    }

    /// A message carrying already-encoded JSON data
    pub fn with_raw<T: Into<String>>(kind: T, data: Box<RawValue>) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            payload: None,
        }
    }

    /// Build a message from any serializable payload
    pub fn from_serializable<T, P>(kind: T, payload: &P) -> RealtimeResult<Self>
    where
        T: Into<String>,
        P: Serialize + ?Sized,
    {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self::with_raw(kind, raw))
    }

    /// The `error` message sent to a peer whose message could not be handled
    pub fn error<T: Into<String>>(message: T) -> Self {
        Self::with_payload(ERROR_MESSAGE_TYPE, json!({ "message": message.into() }))
    }

    /// Decode an inbound frame
    pub fn decode(frame: &[u8]) -> RealtimeResult<Self> {
        let envelope: InboundEnvelope = serde_json::from_slice(frame)
            .map_err(|e| RealtimeError::protocol(format!("malformed envelope: {}", e)))?;

        if envelope.kind.is_empty() {
            return Err(RealtimeError::protocol("message type must not be empty"));
        }

        Ok(Self {
            kind: envelope.kind,
            data: envelope.data,
            payload: None,
        })
    }

    /// Encode into a wire frame.
    ///
    /// Raw data wins over the structured payload; the payload is only
    /// serialized when no raw data is present.
    pub fn encode(&self) -> RealtimeResult<Bytes> {
        let data = match (&self.data, &self.payload) {
            (Some(raw), _) => Some(Cow::Borrowed(raw.as_ref())),
            (None, Some(payload)) => Some(Cow::Owned(serde_json::value::to_raw_value(payload)?)),
            (None, None) => None,
        };

        let envelope = OutboundEnvelope {
            kind: &self.kind,
            data,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Raw JSON data as received, if any
    pub fn raw_data(&self) -> Option<&RawValue> {
        self.data.as_deref()
    }

    /// Structured payload, if this message was built from one
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Whether the message carries any data at all
    pub fn has_data(&self) -> bool {
        self.data.is_some() || self.payload.as_ref().is_some_and(|p| !p.is_null())
    }

    /// Data as a JSON value (`null` when absent)
    pub fn data_value(&self) -> RealtimeResult<Value> {
        match (&self.data, &self.payload) {
            (Some(raw), _) => Ok(serde_json::from_str(raw.get())?),
            (None, Some(payload)) => Ok(payload.clone()),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Decode the data into a handler-specific shape
    pub fn parse_data<T: DeserializeOwned>(&self) -> RealtimeResult<T> {
        let parsed = match (&self.data, &self.payload) {
            (Some(raw), _) => serde_json::from_str(raw.get()),
            (None, Some(payload)) => T::deserialize(payload),
            (None, None) => T::deserialize(Value::Null),
        };

        parsed.map_err(|e| {
            RealtimeError::invalid_payload(format!("invalid data for '{}': {}", self.kind, e))
        })
    }
}
