//! Wire envelope for the ground-control protocol.
//!
//! Every message exchanged with a client is a JSON envelope carrying a
//! protocol version, a short random identifier, an optional reference to the
//! request being answered, and a free-form body whose `type` key is a short
//! uppercase token (e.g. `UAV-INF`, `DEV-SUB`, `ASYNC-RESP`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version stamped into every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Number of random bits in a generated message or receipt identifier.
const ID_BITS: u32 = 60;

/// Generates a random 60-bit identifier, base64-encoded into ten characters.
///
/// The URL-safe base64 alphabet keeps the identifiers path- and
/// query-friendly.
#[must_use]
pub fn generate_id() -> String {
    let alphabet = base64::alphabet::URL_SAFE.as_str().as_bytes();
    let mut bits = rand::random::<u64>() >> (64 - ID_BITS);
    let mut chars = [0_u8; (ID_BITS / 6) as usize];
    for slot in chars.iter_mut().rev() {
        *slot = alphabet[(bits & 0x3f) as usize];
        bits >>= 6;
    }
    chars.iter().map(|&byte| byte as char).collect()
}

/// Errors raised while decoding an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no id")]
    MissingId,
    #[error("message has no body")]
    MissingBody,
    #[error("message body has no type")]
    MissingType,
}

/// A single protocol message: request, response or notification.
///
/// Responses carry the id of the message they answer in [`Envelope::refs`];
/// notifications leave it empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; always [`PROTOCOL_VERSION`] for generated messages.
    #[serde(rename = "$fw.version")]
    pub version: String,

    /// Unique identifier of this message.
    pub id: String,

    /// Identifier of the request this message responds to, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub refs: Option<String>,

    /// Message body; an object whose `type` key is the message type token.
    pub body: Value,
}

impl Envelope {
    /// Returns the message type token from the body, if present.
    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    /// Returns whether this is a response to another message.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.refs.is_some()
    }

    /// Returns whether the message type is experimental (`X-` prefixed).
    ///
    /// Experimental messages bypass schema validation; no schema exists for
    /// them by definition.
    #[must_use]
    pub fn is_experimental(&self) -> bool {
        self.message_type().is_some_and(|t| t.starts_with("X-"))
    }

    /// Returns the `ids` array from the body as owned strings.
    ///
    /// Many request types (`UAV-INF`, `ASYNC-CANCEL`, ...) target multiple
    /// identifiers through this key; a missing or malformed key yields an
    /// empty list.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.body
            .get("ids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decodes a raw JSON value into an envelope, checking the structural
    /// requirements of the protocol: a string `id` and an object body with a
    /// string `type`.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] describing the first structural problem
    /// found.
    pub fn from_value(raw: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(map) = raw else {
            return Err(EnvelopeError::NotAnObject);
        };

        let id = match map.get("id").and_then(Value::as_str) {
            Some(id) => id.to_owned(),
            None => return Err(EnvelopeError::MissingId),
        };
        let refs = map.get("refs").and_then(Value::as_str).map(str::to_owned);
        let version = map
            .get("$fw.version")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION)
            .to_owned();

        let body = match map.get("body") {
            Some(body @ Value::Object(_)) => body.clone(),
            Some(_) | None => return Err(EnvelopeError::MissingBody),
        };
        if body.get("type").and_then(Value::as_str).is_none() {
            return Err(EnvelopeError::MissingType);
        }

        Ok(Self {
            version,
            id,
            refs,
            body,
        })
    }
}

/// Builder for outbound envelopes.
///
/// Stamps the protocol version and a fresh message id into every message and
/// wires responses to the requests they answer.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    version: String,
}

impl MessageBuilder {
    /// Creates a builder for the current protocol version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_owned(),
        }
    }

    /// Creates a notification (a message with no `refs`).
    #[must_use]
    pub fn create_notification(&self, body: Value) -> Envelope {
        Envelope {
            version: self.version.clone(),
            id: generate_id(),
            refs: None,
            body,
        }
    }

    /// Creates a response to the given message.
    ///
    /// When the body lacks a `type` key, the type of the request is copied
    /// into it, so handlers can answer with bare payloads.
    #[must_use]
    pub fn create_response_to(&self, message: &Envelope, body: Value) -> Envelope {
        self.create_response_to_id(&message.id, message.message_type(), body)
    }

    /// Creates a response to a message known only by its id.
    ///
    /// Used for rejecting messages that failed validation before a full
    /// envelope could be constructed.
    #[must_use]
    pub fn create_response_to_id(
        &self,
        request_id: &str,
        request_type: Option<&str>,
        body: Value,
    ) -> Envelope {
        let mut body = body;
        if let Value::Object(map) = &mut body {
            if !map.contains_key("type") {
                if let Some(message_type) = request_type {
                    map.insert("type".to_owned(), Value::String(message_type.to_owned()));
                }
            }
        }
        Envelope {
            version: self.version.clone(),
            id: generate_id(),
            refs: Some(request_id.to_owned()),
            body,
        }
    }

    /// Creates a response when a request is given, a notification otherwise.
    #[must_use]
    pub fn create_response_or_notification(
        &self,
        body: Value,
        in_response_to: Option<&Envelope>,
    ) -> Envelope {
        match in_response_to {
            Some(message) => self.create_response_to(message, body),
            None => self.create_notification(body),
        }
    }

    /// Creates a positive acknowledgment (`ACK-ACK`) of the given message.
    #[must_use]
    pub fn acknowledge(&self, message: &Envelope) -> Envelope {
        self.create_response_to(message, serde_json::json!({ "type": "ACK-ACK" }))
    }

    /// Creates a negative acknowledgment (`ACK-NAK`) of the given message.
    #[must_use]
    pub fn reject(&self, message: &Envelope, reason: Option<&str>) -> Envelope {
        self.create_response_to(message, reject_body(reason))
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an `ACK-NAK` body with an optional reason.
#[must_use]
pub fn reject_body(reason: Option<&str>) -> Value {
    let mut body = Map::new();
    body.insert("type".to_owned(), Value::String("ACK-NAK".to_owned()));
    if let Some(reason) = reason {
        body.insert("reason".to_owned(), Value::String(reason.to_owned()));
    }
    Value::Object(body)
}

/// Response body under construction, with helpers for the per-target
/// partial-success maps of the protocol.
///
/// A multi-target reply may carry any of `success[]`, `error{id -> reason}`,
/// `result{id -> value}` and `receipt{id -> receipt id}` at the body level;
/// this type maintains those keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseBody {
    map: Map<String, Value>,
}

impl ResponseBody {
    /// Creates an empty body; the message type is filled in by the builder
    /// when the body becomes a response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a body with an explicit message type.
    #[must_use]
    pub fn with_type(message_type: &str) -> Self {
        let mut body = Self::default();
        body.insert("type", Value::String(message_type.to_owned()));
        body
    }

    /// Inserts an arbitrary key into the body.
    pub fn insert(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_owned(), value);
    }

    /// Marks the given target id as successfully processed.
    pub fn add_success(&mut self, id: &str) {
        let successes = self
            .map
            .entry("success")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = successes {
            if !items.iter().any(|item| item.as_str() == Some(id)) {
                items.push(Value::String(id.to_owned()));
            }
        }
    }

    /// Records a per-target failure with the given reason.
    pub fn add_error(&mut self, id: &str, reason: impl std::fmt::Display) {
        let errors = self
            .map
            .entry("error")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = errors {
            map.insert(id.to_owned(), Value::String(reason.to_string()));
        }
    }

    /// Records a per-target result value.
    pub fn add_result(&mut self, id: &str, value: Value) {
        let results = self
            .map
            .entry("result")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = results {
            map.insert(id.to_owned(), value);
        }
    }

    /// Records the receipt id of an asynchronous operation started for the
    /// given target.
    pub fn add_receipt(&mut self, id: &str, receipt_id: &str) {
        let receipts = self
            .map
            .entry("receipt")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = receipts {
            map.insert(id.to_owned(), Value::String(receipt_id.to_owned()));
        }
    }

    /// Returns whether the body has no keys yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Consumes the builder, yielding the JSON body.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.map)
    }
}

impl From<ResponseBody> for Value {
    fn from(body: ResponseBody) -> Self {
        body.into_value()
    }
}
