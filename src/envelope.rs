use std::time::Duration;

/// Content type of every envelope produced by the JSON layer.
///
/// It is also the only content type a listener accepts.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Transport wrapper around a message.
///
/// `Envelope` bundles a message payload together with its headers. It is
/// generic so the same wrapper can carry a domain object on its way into the
/// JSON layer and the encoded bytes on their way to the broker:
///
/// - `Envelope<Headers, Order>` before encoding
/// - `Envelope<Headers, RawPayload>` on the wire
///
/// `Envelope` implements `From<(H, M)>` for construction from a tuple.
///
/// ## Example
///
/// ```rust
/// use orderbus::{Envelope, Headers};
/// use orderbus::transport::RawPayload;
///
/// let headers = Headers::new("text/plain", "Note", "note-1");
/// let envelope: Envelope<_, _> = (headers, RawPayload::from(b"hello".to_vec())).into();
///
/// assert_eq!(envelope.headers.message_id, "note-1");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Broker-facing envelope properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    /// MIME type of the body. Listeners only accept [`CONTENT_TYPE_JSON`].
    pub content_type: String,
    /// Informational type name of the payload.
    pub label: String,
    /// Identifier of the logical message, stable across redeliveries.
    pub message_id: String,
    /// Message lifetime. `None` lets the broker apply its default.
    pub time_to_live: Option<Duration>,
}

impl Headers {
    pub fn new(
        content_type: impl Into<String>,
        label: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            label: label.into(),
            message_id: message_id.into(),
            time_to_live: None,
        }
    }

    /// Override the broker's default time-to-live.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Whether the body is declared as JSON.
    pub fn is_json(&self) -> bool {
        self.content_type == CONTENT_TYPE_JSON
    }
}
