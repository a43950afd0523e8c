//! Topic publisher.
//!
//! A [`TopicPublisher`] turns domain payloads into envelopes and sends them to
//! one topic through a Tower stack:
//!
//! ```text
//! TimeoutLayer -> JsonLayer -> SenderService -> broker Sender
//! ```
//!
//! Every publish is a single round trip that resolves once the broker
//! confirms. There is no local buffering or batching.

use std::time::Duration;

use tower::timeout::{Timeout, TimeoutLayer};
use tracing_error::SpanTrace;

use crate::{
    Envelope, Headers, Order, OrderId, PublishRequest,
    codec::Payload,
    envelope::CONTENT_TYPE_JSON,
    transport::{
        RawPayload, Sender, SenderService, Transport, TransportError, TransportErrorKind,
        layers::{JsonLayer, JsonService},
    },
};

/// Time allowed for the broker to confirm a publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Service stack used by [`TopicPublisher`].
pub type PublishStack<D> = Timeout<JsonService<SenderService<D>>>;

/// Publisher bound to a single topic.
///
/// The publisher owns its sender. [`close`](Self::close) releases it
/// explicitly; on any other exit path the sender and its connection are
/// released when the publisher is dropped.
pub struct TopicPublisher<D> {
    topic: String,
    sender: D,
    transport: Transport<PublishStack<D>>,
}

impl<D> TopicPublisher<D>
where
    D: Sender<Headers, RawPayload> + Clone + Send + 'static,
{
    /// Create a publisher for `topic` using a sender already bound to it.
    pub fn new(topic: impl Into<String>, sender: D) -> Self {
        Self::with_timeout(topic, sender, DEFAULT_PUBLISH_TIMEOUT)
    }

    /// Create a publisher with a custom confirmation timeout.
    pub fn with_timeout(topic: impl Into<String>, sender: D, timeout: Duration) -> Self {
        let transport = Transport::new(sender.clone())
            .layer(JsonLayer)
            .layer(TimeoutLayer::new(timeout));

        Self {
            topic: topic.into(),
            sender,
            transport,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a payload.
    ///
    /// The envelope carries the JSON content type, the payload's type name
    /// as label and its identifier as message id.
    #[tracing::instrument(skip_all, fields(topic = %self.topic, message_id))]
    pub async fn publish<P>(&mut self, payload: P) -> Result<(), PublishError>
    where
        P: Payload + Send + 'static,
    {
        let message_id = payload.message_id();
        tracing::Span::current().record("message_id", message_id.as_str());

        let headers = Headers::new(CONTENT_TYPE_JSON, P::TYPE_NAME, message_id);
        self.transport
            .send(Envelope {
                headers,
                message: payload,
            })
            .await
            .map_err(PublishError::from)?;

        tracing::info!("Message published");
        Ok(())
    }

    /// Build an order from a request and publish it.
    ///
    /// Returns the identifier of the published order.
    pub async fn publish_order(&mut self, request: PublishRequest) -> Result<OrderId, PublishError> {
        let order = Order::from(request);
        let order_id = order.order_id();
        self.publish(order).await?;
        Ok(order_id)
    }

    /// Release the sender and its connection.
    #[tracing::instrument(skip_all, fields(topic = %self.topic))]
    pub async fn close(mut self) -> Result<(), PublishError> {
        self.sender
            .close()
            .await
            .map_err(|e| PublishError::close(e.into()))?;
        tracing::debug!("Publisher closed");
        Ok(())
    }
}

/// Error returned when a payload could not be published.
///
/// The `Display` output contains transport details and is meant for logs,
/// not for end users.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish errors kind.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The payload failed validation or could not be encoded.
    InvalidPayload(TransportError),
    /// The broker did not confirm in time.
    Timeout(TransportError),
    /// The broker rejected the message or could not be reached.
    Transport(TransportError),
    /// Releasing the sender failed.
    Close(tower::BoxError),
}

impl PublishError {
    fn close(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Close(err),
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        let kind = match err.kind() {
            TransportErrorKind::Serde(_) => PublishErrorKind::InvalidPayload(err),
            TransportErrorKind::Timeout => PublishErrorKind::Timeout(err),
            TransportErrorKind::Sender(_) => PublishErrorKind::Transport(err),
        };
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::InvalidPayload(err) => writeln!(f, "Invalid payload: {err}"),
            PublishErrorKind::Timeout(err) => writeln!(f, "Publish timed out: {err}"),
            PublishErrorKind::Transport(err) => writeln!(f, "Publish failed: {err}"),
            PublishErrorKind::Close(err) => writeln!(f, "Failed to close publisher: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::InvalidPayload(err)
            | PublishErrorKind::Timeout(err)
            | PublishErrorKind::Transport(err) => Some(err),
            PublishErrorKind::Close(err) => Some(err.as_ref()),
        }
    }
}
