//! JSON message codec.
//!
//! Converts payloads to and from the UTF-8 JSON bodies carried by
//! [`Envelope`](crate::Envelope)s. The codec is pure: it performs no I/O and
//! has no side effects.
//!
//! For any payload `p` produced by [`encode`], `decode(&encode(&p)?)` yields a
//! value equal to `p`.

use serde::{Serialize, de::DeserializeOwned};
use tracing_error::SpanTrace;

/// A domain object that can travel through a topic.
pub trait Payload: Serialize + DeserializeOwned {
    /// Type name written to the envelope label.
    const TYPE_NAME: &'static str;

    /// Identifier used as the envelope message id.
    fn message_id(&self) -> String;

    /// Business rules serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Serialize a payload into a JSON document.
pub fn encode<P: Payload>(payload: &P) -> Result<Vec<u8>, MalformedPayload> {
    payload.validate().map_err(MalformedPayload::invalid)?;
    serde_json::to_vec(payload).map_err(MalformedPayload::json)
}

/// Deserialize a payload from a JSON document.
///
/// Fails when the bytes are not JSON, when a required field is missing or has
/// the wrong type, or when the decoded value does not validate.
pub fn decode<P: Payload>(bytes: &[u8]) -> Result<P, MalformedPayload> {
    let payload: P = serde_json::from_slice(bytes).map_err(MalformedPayload::json)?;
    payload.validate().map_err(MalformedPayload::invalid)?;
    Ok(payload)
}

/// Error returned when a body cannot be turned into a payload, or the other
/// way around.
#[derive(Debug)]
pub struct MalformedPayload {
    context: SpanTrace,
    kind: MalformedPayloadKind,
}

/// Malformed payload kinds.
#[derive(Debug)]
pub enum MalformedPayloadKind {
    /// The body is not valid JSON for the payload type.
    Json(serde_json::Error),
    /// The body decoded but violates a payload rule.
    Invalid(String),
}

impl MalformedPayload {
    fn json(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MalformedPayloadKind::Json(err),
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: MalformedPayloadKind::Invalid(reason),
        }
    }

    pub fn kind(&self) -> &MalformedPayloadKind {
        &self.kind
    }

    /// One-line description without the span trace, suitable for a
    /// dead-letter description.
    pub fn summary(&self) -> String {
        match &self.kind {
            MalformedPayloadKind::Json(err) => format!("Unable to decode message body: {err}"),
            MalformedPayloadKind::Invalid(reason) => format!("Invalid message body: {reason}"),
        }
    }
}

impl std::fmt::Display for MalformedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MalformedPayloadKind::Json(err) => writeln!(f, "Malformed JSON payload: {err}"),
            MalformedPayloadKind::Invalid(reason) => writeln!(f, "Invalid payload: {reason}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for MalformedPayload {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            MalformedPayloadKind::Json(err) => Some(err),
            MalformedPayloadKind::Invalid(_) => None,
        }
    }
}
