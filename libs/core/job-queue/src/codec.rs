//! Envelope codec
//!
//! A job travels as `{ "type": ..., "version": ..., "data": { ... } }`.
//! [`Codec`] turns envelopes into bytes and back; [`JsonCodec`] is the default.

use crate::error::JobQueueError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire envelope produced for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub job_type: String,
    pub version: String,
    pub data: Map<String, Value>,
}

/// Envelope as read off the wire, before any of it is trusted.
///
/// `type` and `version` may be missing or have the wrong shape; carrier
/// formats put the real envelope under some other key, kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type", default)]
    job_type: Option<Value>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn scalar_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RawEnvelope {
    /// Declared job type, if present
    pub fn job_type(&self) -> Option<String> {
        scalar_to_string(self.job_type.as_ref())
    }

    /// Declared version, stringified if it was sent as a number
    pub fn version(&self) -> Option<String> {
        scalar_to_string(self.version.as_ref())
    }

    /// Whether both routing keys are present
    pub fn is_routable(&self) -> bool {
        self.job_type().is_some() && self.version().is_some()
    }

    /// Value of a key outside the envelope proper
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Interpret a JSON value as an envelope
    pub fn from_value(value: Value) -> Result<Self, JobQueueError> {
        serde_json::from_value(value).map_err(|e| JobQueueError::MalformedEnvelope(e.to_string()))
    }

    /// Convert into a trusted envelope
    pub fn into_envelope(self) -> Result<Envelope, JobQueueError> {
        let job_type = self
            .job_type()
            .ok_or_else(|| JobQueueError::MalformedEnvelope("missing type".to_string()))?;
        let version = self
            .version()
            .ok_or_else(|| JobQueueError::MalformedEnvelope("missing version".to_string()))?;
        let data = match self.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(JobQueueError::MalformedEnvelope(format!(
                    "data must be an object, got {other}"
                )));
            }
        };
        Ok(Envelope {
            job_type,
            version,
            data,
        })
    }
}

/// Codec capability
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, JobQueueError>;

    fn decode(&self, bytes: &[u8]) -> Result<RawEnvelope, JobQueueError>;
}

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, JobQueueError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RawEnvelope, JobQueueError> {
        serde_json::from_slice(bytes).map_err(|e| JobQueueError::MalformedEnvelope(e.to_string()))
    }
}

/// Decode a message body, falling back to a nested payload.
///
/// When the body lacks `type` or `version` and `nested_key` is set, the value
/// under that key is decoded instead. Notification wrappers carry it as a
/// JSON string; an embedded object is accepted as well. A missing or
/// non-envelope nested value yields an empty envelope, which the caller
/// treats as unroutable.
pub fn extract_envelope(
    codec: &dyn Codec,
    body: &[u8],
    nested_key: Option<&str>,
) -> Result<RawEnvelope, JobQueueError> {
    let raw = codec.decode(body)?;
    if raw.is_routable() {
        return Ok(raw);
    }
    let Some(key) = nested_key else {
        return Ok(raw);
    };

    match raw.extra(key) {
        Some(Value::String(nested)) => codec.decode(nested.as_bytes()),
        Some(value @ Value::Object(_)) => RawEnvelope::from_value(value.clone()),
        _ => Ok(RawEnvelope::default()),
    }
}
