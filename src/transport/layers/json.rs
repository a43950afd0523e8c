use crate::{
    Envelope, Headers,
    codec::{self, Payload},
    envelope::CONTENT_TYPE_JSON,
    transport::RawPayload,
};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that encodes payloads to JSON.
///
/// This service converts any [`Payload`] into a [`RawPayload`] using the
/// [`codec`], and stamps the envelope with the JSON content type before
/// passing it to the inner service.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Envelope<Headers, M>> for JsonService<T>
where
    M: Payload + Send + 'static,
    T: Service<Envelope<Headers, RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<Headers, RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<Headers, M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let bytes = codec::encode(&req.message)?;
            let mut headers = req.headers;
            headers.content_type = CONTENT_TYPE_JSON.to_owned();
            let envelope = Envelope {
                headers,
                message: RawPayload(bytes),
            };

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
        task::{Context, Poll},
    };

    use rust_decimal::Decimal;

    use super::*;
    use crate::{Order, transport::TransportErrorKind, transport::Transport};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Envelope<Headers, RawPayload>>>>);

    impl Service<Envelope<Headers, RawPayload>> for Capture {
        type Response = ();
        type Error = Infallible;
        type Future = std::future::Ready<Result<(), Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Envelope<Headers, RawPayload>) -> Self::Future {
            self.0.lock().unwrap().push(req);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn encodes_and_stamps_content_type() {
        let capture = Capture::default();
        let mut service = JsonLayer.layer(capture.clone());

        let order = Order::new("Ada", "Widget", Decimal::new(999, 2), 3);
        let headers = Headers::new("", "Order", order.order_id().to_string());
        service
            .call(Envelope {
                headers,
                message: order.clone(),
            })
            .await
            .unwrap();

        let sent = capture.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.content_type, CONTENT_TYPE_JSON);
        let decoded: Order = codec::decode(&sent[0].message.0).unwrap();
        assert_eq!(decoded, order);
    }

    #[tokio::test]
    async fn invalid_payload_surfaces_as_serde_error() {
        let capture = Capture::default();
        let mut transport = Transport {
            service: JsonLayer.layer(capture.clone()),
        };

        let order = Order::new("Ada", "Widget", Decimal::new(-1, 0), 3);
        let headers = Headers::new("", "Order", order.order_id().to_string());
        let err = transport
            .send(Envelope {
                headers,
                message: order,
            })
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Serde(_)));
        assert!(capture.0.lock().unwrap().is_empty());
    }
}
