//! Transport abstractions used by the publishing side.
//!
//! This module defines a Tower-compatible transport used to send
//! [`Envelope`]s to a broker topic. Broker backends only implement
//! [`Sender`]; encoding, time limits and error normalization are composed
//! on top of them as Tower layers.
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper around a layered service
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by broker backends
//! - [`TransportError`]: Unified error type with tracing context

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::Envelope;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` wraps an underlying Tower `Service`, lets middleware be
/// stacked on it with [`layer`](Transport::layer) and normalizes errors into
/// [`TransportError`] in [`send`](Transport::send).
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a broker sender.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Send an [`Envelope`] through the transport.
    ///
    /// Resolves once the innermost sender reports that the broker accepted
    /// the message.
    pub async fn send<H, M>(&mut self, envelope: Envelope<H, M>) -> Result<(), TransportError>
    where
        S: Service<Envelope<H, M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        std::future::poll_fn(|cx| service.poll_ready(cx))
            .await
            .map_err(|e| TransportError::sender(e.into()))?;
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::sender(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization.
    Serde(tower::BoxError),
    /// The broker did not confirm within the configured time limit.
    Timeout,
}

impl TransportError {
    /// Create a sender-related transport error.
    ///
    /// Errors produced by the encoding layer or by a timeout layer further
    /// down the stack are recognised and classified accordingly.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let kind = if err.is::<tower::timeout::error::Elapsed>() {
            TransportErrorKind::Timeout
        } else if err.is::<crate::MalformedPayload>() {
            TransportErrorKind::Serde(err)
        } else {
            TransportErrorKind::Sender(err)
        };

        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            TransportErrorKind::Timeout => writeln!(f, "Timed out waiting for broker confirmation"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Timeout => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<H, M, D> Service<Envelope<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by broker backends able to publish to one topic.
///
/// A sender is bound to its topic when it is created; every envelope it
/// receives is published there.
#[async_trait::async_trait]
pub trait Sender<H, M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish an envelope and wait for the broker to accept it.
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error>;

    /// Release the sender and any connection it owns.
    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPayload(pub(crate) Vec<u8>);

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for RawPayload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handing bodies to a
/// broker client.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        &self.0
    }
}
