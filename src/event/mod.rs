//! Queue envelopes and wire-ready log events
//!
//! Raw queue items are JSON commands of the form
//! `{"type": "...", "params": {"momoid": "...", "businessName": "...", "type": "...", "body": {...}}}`.
//! An [`Envelope`] is the validated view of such an item, and an [`Event`]
//! is what the collector receives: the routing headers plus a tab-delimited
//! payload `id \t action \t json(body)` where the body carries an extra
//! `business_type` key.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Key injected into every event body, naming the originating business
pub const BUSINESS_TYPE_KEY: &str = "business_type";

/// Errors raised while decoding a queue item
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} has wrong type, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(rename = "type", default)]
    _kind: Option<Value>,

    #[serde(default)]
    params: Option<Value>,
}

/// A decoded queue item
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub business_name: String,
    pub action: String,
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Decode and validate raw queue bytes
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let command: RawCommand = serde_json::from_slice(raw)?;

        let params = match command.params {
            Some(Value::Object(params)) => params,
            Some(_) => {
                return Err(EnvelopeError::WrongType {
                    field: "params",
                    expected: "object",
                })
            }
            None => return Err(EnvelopeError::MissingField("params")),
        };

        let id = string_field(&params, "momoid")?;
        let business_name = string_field(&params, "businessName")?;
        let action = string_field(&params, "type")?;

        let body = match params.get("body") {
            Some(Value::Object(body)) => body.clone(),
            Some(_) => {
                return Err(EnvelopeError::WrongType {
                    field: "body",
                    expected: "object",
                })
            }
            None => return Err(EnvelopeError::MissingField("body")),
        };

        Ok(Self {
            id,
            business_name,
            action,
            body,
        })
    }
}

fn string_field(params: &Map<String, Value>, field: &'static str) -> Result<String, EnvelopeError> {
    match params.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EnvelopeError::WrongType {
            field,
            expected: "string",
        }),
        None => Err(EnvelopeError::MissingField(field)),
    }
}

/// A wire-ready log event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Routing header: the business the event belongs to
    pub business_name: String,

    /// Routing header: the action type
    pub action: String,

    /// `id \t action \t json(body)`
    pub payload: String,
}

impl Event {
    /// Build an event from a validated envelope
    pub fn from_envelope(envelope: Envelope) -> Result<Self, EnvelopeError> {
        let Envelope {
            id,
            business_name,
            action,
            mut body,
        } = envelope;

        body.insert(
            BUSINESS_TYPE_KEY.to_string(),
            Value::String(business_name.clone()),
        );
        let body = serde_json::to_string(&body)?;

        let payload = format!("{}\t{}\t{}", id, action, body);

        Ok(Self {
            business_name,
            action,
            payload,
        })
    }

    /// Decode raw queue bytes straight into an event
    pub fn decode(raw: &[u8]) -> Result<Self, EnvelopeError> {
        Envelope::decode(raw).and_then(Self::from_envelope)
    }
}
