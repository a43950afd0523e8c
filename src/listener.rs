//! Delivery loop for one subscription.
//!
//! A [`Listener`] pulls deliveries from a subscription and runs each of them
//! on its own task, at most `max_concurrent_calls` at a time. For every
//! delivery it:
//!
//! - Dead-letters it when the content type is not JSON
//! - Dead-letters it when the body cannot be decoded
//! - Calls the [`Handler`] with the decoded message
//! - Completes it when the handler succeeds, abandons it otherwise
//!
//! Abandoned deliveries come back from the broker until the subscription's
//! max delivery count is reached. The loop never retries on its own.
//!
//! The loop runs until its [`CancellationToken`] is triggered or the receive
//! path breaks. In both cases it stops pulling and waits for in-flight
//! deliveries to settle before returning.

use std::{future::Future, marker::PhantomData, num::NonZeroUsize, sync::Arc};

use tokio::{
    sync::{Semaphore, watch},
    task::{JoinError, JoinSet},
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    broker::{Delivery, DeliveryMetadata, ReceiveMessages, SettleMessages},
    codec::{self, Payload},
    transport::ToBytes,
};

/// Dead-letter reason for deliveries whose content type is not JSON.
pub const INVALID_CONTENT_TYPE: &str = "Invalid Content Type";

/// Dead-letter reason for JSON deliveries that cannot be decoded.
pub const MALFORMED_PAYLOAD: &str = "Malformed Payload";

/// Lifecycle of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, `run` not called yet.
    Idle,
    /// Pulling deliveries.
    Listening,
    /// No longer pulling, waiting for in-flight deliveries.
    Stopping,
    Stopped,
}

/// How a single delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Abandoned,
    DeadLettered,
    /// Settlement failed; the broker will redeliver once the lock expires.
    Unsettled,
}

/// Message handler.
///
/// Implemented for any `Fn(M, DeliveryMetadata) -> impl Future<Output =
/// Result<(), E>>`, so closures can be used directly.
#[async_trait::async_trait]
pub trait Handler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M, metadata: DeliveryMetadata)
    -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<M, F, Fut, E> Handler<M> for F
where
    M: Send + 'static,
    F: Fn(M, DeliveryMetadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<tower::BoxError> + 'static,
{
    async fn handle(
        &self,
        message: M,
        metadata: DeliveryMetadata,
    ) -> Result<(), tower::BoxError> {
        (self)(message, metadata).await.map_err(Into::into)
    }
}

/// Subscription listener.
///
/// Generic parameters:
/// - `B`: Subscription backend, cloned into every delivery task
/// - `M`: Decoded message type
/// - `HD`: Message handler
/// - `HK`: Hook implementation for lifecycle events
pub struct Listener<B, M, HD, HK = DefaultListenerHook> {
    subscription: B,
    handler: Arc<HD>,
    hook: Arc<HK>,
    max_concurrent_calls: usize,
    state: watch::Sender<ListenerState>,
    message_marker: PhantomData<fn() -> M>,
}

impl<B, M, HD> Listener<B, M, HD, DefaultListenerHook>
where
    HD: Handler<M>,
{
    /// Create a listener with the default hook and one concurrent call per
    /// available CPU.
    pub fn new(subscription: B, handler: HD) -> Self {
        let max_concurrent_calls = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

        Self {
            subscription,
            handler: Arc::new(handler),
            hook: Arc::new(DefaultListenerHook),
            max_concurrent_calls,
            state: watch::channel(ListenerState::Idle).0,
            message_marker: PhantomData,
        }
    }
}

impl<B, M, HD, HK> Listener<B, M, HD, HK>
where
    B: ReceiveMessages + SettleMessages + Clone + Send + Sync + 'static,
    <B as ReceiveMessages>::Error: Into<tower::BoxError>,
    <B as SettleMessages>::Error: Into<tower::BoxError>,
    M: Payload + Send + 'static,
    HD: Handler<M>,
    HK: ListenerHook,
{
    /// Limit the number of deliveries processed at once. Values below 1 are
    /// raised to 1.
    pub fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls.max(1);
        self
    }

    /// Replace the listener hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ListenerHook>(self, hook: HK2) -> Listener<B, M, HD, HK2> {
        Listener {
            subscription: self.subscription,
            handler: self.handler,
            hook: Arc::new(hook),
            max_concurrent_calls: self.max_concurrent_calls,
            state: self.state,
            message_marker: self.message_marker,
        }
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    /// Observe the listener state. Receivers keep working after `run`
    /// consumed the listener.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Run the delivery loop until `cancel` is triggered or receiving fails.
    ///
    /// Returns `Ok(())` after a cancellation, once every in-flight delivery
    /// has been settled. A broken receive path is reported as a
    /// [`ListenerFault`], also after draining.
    #[tracing::instrument(skip_all, fields(max_concurrent_calls = self.max_concurrent_calls))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ListenerFault> {
        let Listener {
            subscription,
            handler,
            hook,
            max_concurrent_calls,
            state,
            ..
        } = self;

        hook.on_startup(max_concurrent_calls);

        let mut stream = match subscription.messages(cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                let err: tower::BoxError = err.into();
                hook.on_receive_error(err.as_ref());
                state.send_replace(ListenerState::Stopped);
                return Err(ListenerFault::receive(err));
            }
        };
        state.send_replace(ListenerState::Listening);

        let semaphore = Arc::new(Semaphore::new(max_concurrent_calls));
        let mut tasks = JoinSet::new();
        let mut fault = None;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                report(&*hook, joined);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let subscription = subscription.clone();
                    let handler = handler.clone();
                    let hook = hook.clone();
                    tasks.spawn(async move {
                        let outcome =
                            process::<B, M, HD, HK>(&subscription, &*handler, &*hook, delivery)
                                .await;
                        drop(permit);
                        outcome
                    });
                }
                Some(Err(err)) => {
                    let err: tower::BoxError = err.into();
                    hook.on_receive_error(err.as_ref());
                    fault = Some(ListenerFault::receive(err));
                    break;
                }
                None => {
                    hook.on_stream_end();
                    fault = Some(ListenerFault::stream_ended());
                    break;
                }
            }
        }

        state.send_replace(ListenerState::Stopping);
        hook.on_shutdown(tasks.len());
        drop(stream);

        while let Some(joined) = tasks.join_next().await {
            report(&*hook, joined);
        }
        state.send_replace(ListenerState::Stopped);

        match fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn report<HK: ListenerHook>(hook: &HK, joined: Result<DeliveryOutcome, JoinError>) {
    match joined {
        Ok(outcome) => tracing::trace!(?outcome, "Delivery task finished"),
        Err(err) => hook.on_task_panic(&err),
    }
}

async fn process<B, M, HD, HK>(
    subscription: &B,
    handler: &HD,
    hook: &HK,
    delivery: Delivery,
) -> DeliveryOutcome
where
    B: SettleMessages + Sync,
    B::Error: Into<tower::BoxError>,
    M: Payload + Send + 'static,
    HD: Handler<M>,
    HK: ListenerHook,
{
    let metadata = delivery.metadata();
    hook.on_received(&metadata);

    if !delivery.envelope.headers.is_json() {
        let description = format!(
            "Unable to process a message with a Content Type of {}",
            metadata.content_type
        );
        return dead_letter(
            subscription,
            hook,
            &delivery,
            &metadata,
            INVALID_CONTENT_TYPE,
            description,
        )
        .await;
    }

    let message = match codec::decode::<M>(delivery.envelope.message.to_bytes()) {
        Ok(message) => message,
        Err(err) => {
            return dead_letter(
                subscription,
                hook,
                &delivery,
                &metadata,
                MALFORMED_PAYLOAD,
                err.summary(),
            )
            .await;
        }
    };

    match handler.handle(message, metadata.clone()).await {
        Ok(()) => match subscription.complete(&delivery).await {
            Ok(()) => {
                hook.on_completed(&metadata);
                DeliveryOutcome::Completed
            }
            Err(err) => {
                let err: tower::BoxError = err.into();
                hook.on_settle_error(&metadata, err.as_ref());
                DeliveryOutcome::Unsettled
            }
        },
        Err(err) => {
            hook.on_handler_error(&metadata, err.as_ref());
            match subscription.abandon(&delivery).await {
                Ok(()) => DeliveryOutcome::Abandoned,
                Err(err) => {
                    let err: tower::BoxError = err.into();
                    hook.on_settle_error(&metadata, err.as_ref());
                    DeliveryOutcome::Unsettled
                }
            }
        }
    }
}

async fn dead_letter<B, HK>(
    subscription: &B,
    hook: &HK,
    delivery: &Delivery,
    metadata: &DeliveryMetadata,
    reason: &str,
    description: String,
) -> DeliveryOutcome
where
    B: SettleMessages + Sync,
    B::Error: Into<tower::BoxError>,
    HK: ListenerHook,
{
    match subscription.dead_letter(delivery, reason, &description).await {
        Ok(()) => {
            hook.on_dead_lettered(metadata, reason, &description);
            DeliveryOutcome::DeadLettered
        }
        Err(err) => {
            let err: tower::BoxError = err.into();
            hook.on_settle_error(metadata, err.as_ref());
            DeliveryOutcome::Unsettled
        }
    }
}

/// Error returned when the delivery loop stops without being cancelled.
#[derive(Debug)]
pub struct ListenerFault {
    context: SpanTrace,
    kind: ListenerFaultKind,
}

/// Classification of listener faults.
#[derive(Debug)]
pub enum ListenerFaultKind {
    /// The receive path failed.
    Receive(tower::BoxError),
    /// The receive stream ended while the listener was still running.
    StreamEnded,
}

impl ListenerFault {
    fn receive(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ListenerFaultKind::Receive(err),
        }
    }

    fn stream_ended() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ListenerFaultKind::StreamEnded,
        }
    }

    pub fn kind(&self) -> &ListenerFaultKind {
        &self.kind
    }
}

impl std::fmt::Display for ListenerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ListenerFaultKind::Receive(err) => writeln!(f, "Receive error: {err}"),
            ListenerFaultKind::StreamEnded => writeln!(f, "Receive stream ended unexpectedly"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ListenerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ListenerFaultKind::Receive(err) => Some(err.as_ref()),
            ListenerFaultKind::StreamEnded => None,
        }
    }
}

/// Hook trait for observing listener lifecycle events.
///
/// Hooks are invoked synchronously, some of them from delivery tasks, and
/// should avoid heavy or blocking work.
pub trait ListenerHook: Send + Sync + 'static {
    fn on_startup(&self, max_concurrent_calls: usize);
    fn on_shutdown(&self, in_flight: usize);
    fn on_received(&self, metadata: &DeliveryMetadata);
    fn on_completed(&self, metadata: &DeliveryMetadata);
    fn on_dead_lettered(&self, metadata: &DeliveryMetadata, reason: &str, description: &str);
    fn on_handler_error(&self, metadata: &DeliveryMetadata, error: &dyn std::error::Error);
    fn on_settle_error(&self, metadata: &DeliveryMetadata, error: &dyn std::error::Error);
    fn on_receive_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
    fn on_task_panic(&self, error: &JoinError);
}

/// Default listener hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultListenerHook;

impl ListenerHook for DefaultListenerHook {
    fn on_startup(&self, max_concurrent_calls: usize) {
        tracing::info!(max_concurrent_calls, "Listener is starting up");
    }

    fn on_shutdown(&self, in_flight: usize) {
        tracing::info!(in_flight, "Listener is shutting down");
    }

    fn on_received(&self, metadata: &DeliveryMetadata) {
        tracing::debug!(
            message_id = %metadata.message_id,
            delivery_count = metadata.delivery_count,
            "Message received"
        );
    }

    fn on_completed(&self, metadata: &DeliveryMetadata) {
        tracing::info!(message_id = %metadata.message_id, "Message completed");
    }

    fn on_dead_lettered(&self, metadata: &DeliveryMetadata, reason: &str, description: &str) {
        tracing::warn!(
            message_id = %metadata.message_id,
            reason,
            description,
            "Message dead-lettered"
        );
    }

    fn on_handler_error(&self, metadata: &DeliveryMetadata, error: &dyn std::error::Error) {
        tracing::error!(
            message_id = %metadata.message_id,
            delivery_count = metadata.delivery_count,
            ?error,
            "Handler failed, abandoning message"
        );
    }

    fn on_settle_error(&self, metadata: &DeliveryMetadata, error: &dyn std::error::Error) {
        tracing::error!(message_id = %metadata.message_id, ?error, "Failed to settle message");
    }

    fn on_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving messages");
    }

    fn on_stream_end(&self) {
        tracing::error!("Receive stream ended");
    }

    fn on_task_panic(&self, error: &JoinError) {
        tracing::error!(?error, "Delivery task panicked, message left unsettled");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        str::FromStr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use rust_decimal::Decimal;
    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::{
        Envelope, Headers, Order, PublishRequest,
        broker::{
            MAX_DELIVERY_COUNT_EXCEEDED, ManageSubscriptions, SubscriptionDescription,
            inmemory::{InMemoryBroker, InMemorySubscription},
        },
        publisher::TopicPublisher,
        transport::{RawPayload, Sender},
    };

    const TOPIC: &str = "orders";
    const SUB: &str = "billing";

    async fn setup() -> (InMemoryBroker, InMemorySubscription) {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC).await.unwrap();
        broker
            .create_subscription(&SubscriptionDescription::new(TOPIC, SUB))
            .await
            .unwrap();
        let subscription = broker.subscription(TOPIC, SUB);
        (broker, subscription)
    }

    fn request(customer: &str, quantity: u32) -> PublishRequest {
        PublishRequest {
            customer_name: customer.into(),
            item_name: "Widget".into(),
            unit_price: Decimal::from_str("9.99").unwrap(),
            quantity,
            order_id: None,
        }
    }

    async fn publish(broker: &InMemoryBroker, request: PublishRequest) -> String {
        let sender = broker.topic_sender(TOPIC).await.unwrap();
        let mut publisher = TopicPublisher::new(TOPIC, sender);
        publisher.publish_order(request).await.unwrap().to_string()
    }

    async fn send_raw(broker: &InMemoryBroker, content_type: &str, id: &str, body: &str) {
        let mut sender = broker.topic_sender(TOPIC).await.unwrap();
        sender
            .send(Envelope {
                headers: Headers::new(content_type, "Order", id),
                message: RawPayload::from(body),
            })
            .await
            .unwrap();
    }

    /// Wait until `settled` messages were completed or dead-lettered.
    async fn wait_settled(broker: &InMemoryBroker, settled: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = broker.completed(TOPIC, SUB).await.len()
                    + broker.dead_letters(TOPIC, SUB).await.len();
                if done >= settled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages were not settled in time");
    }

    fn ok() -> Result<(), tower::BoxError> {
        Ok(())
    }

    #[tokio::test]
    async fn published_order_is_handled_once_and_completed() {
        let (broker, subscription) = setup().await;
        let received = Arc::new(Mutex::new(Vec::new()));

        let seen = received.clone();
        let listener = Listener::new(subscription, move |order: Order, metadata: DeliveryMetadata| {
            seen.lock().unwrap().push((order, metadata));
            async { ok() }
        });

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        let message_id = publish(&broker, request("Ada", 3)).await;
        wait_settled(&broker, 1).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (order, metadata) = &received[0];
        assert_eq!(order.customer_name, "Ada");
        assert_eq!(order.item_name, "Widget");
        assert_eq!(order.unit_price, Decimal::from_str("9.99").unwrap());
        assert_eq!(order.quantity, 3);
        assert_eq!(order.order_id().to_string(), metadata.message_id);
        assert_eq!(metadata.message_id, message_id);
        assert_eq!(metadata.label, "Order");
        assert_eq!(metadata.delivery_count, 1);

        assert_eq!(broker.completed(TOPIC, SUB).await, vec![message_id]);
        assert_eq!(broker.active_count(TOPIC, SUB).await, 0);
        assert_eq!(broker.locked_count(TOPIC, SUB).await, 0);
    }

    #[tokio::test]
    async fn non_json_content_is_dead_lettered_without_calling_handler() {
        let (broker, subscription) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let listener = Listener::new(subscription, move |_: Order, _: DeliveryMetadata| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { ok() }
        });

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        send_raw(&broker, "text/plain", "plain-1", "hello").await;
        send_raw(&broker, "text/plain", "plain-2", "").await;
        wait_settled(&broker, 2).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let dead = broker.dead_letters(TOPIC, SUB).await;
        assert_eq!(dead.len(), 2);
        for letter in &dead {
            assert_eq!(letter.reason, INVALID_CONTENT_TYPE);
            assert_eq!(
                letter.description,
                "Unable to process a message with a Content Type of text/plain"
            );
        }
    }

    #[tokio::test]
    async fn undecodable_json_is_dead_lettered_as_malformed() {
        let (broker, subscription) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let listener = Listener::new(subscription, move |_: Order, _: DeliveryMetadata| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { ok() }
        });

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        send_raw(&broker, "application/json", "empty", "").await;
        send_raw(&broker, "application/json", "partial", r#"{"OrderID":"abc"}"#).await;
        wait_settled(&broker, 2).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let dead = broker.dead_letters(TOPIC, SUB).await;
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.reason == MALFORMED_PAYLOAD));
        assert!(dead.iter().all(|d| !d.description.is_empty()));
    }

    #[tokio::test]
    async fn failing_handler_stops_seeing_message_after_max_deliveries() {
        let (broker, subscription) = setup().await;
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let seen = attempts.clone();
        let listener = Listener::new(subscription, move |_: Order, metadata: DeliveryMetadata| {
            seen.lock().unwrap().push(metadata);
            async { Err::<(), _>(std::io::Error::other("inventory service down")) }
        });

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        let message_id = publish(&broker, request("Grace", 1)).await;
        wait_settled(&broker, 1).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|m| m.message_id == message_id));
        assert_eq!(
            attempts.iter().map(|m| m.delivery_count).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let dead = broker.dead_letters(TOPIC, SUB).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
        assert_eq!(dead[0].envelope.headers.message_id, message_id);
    }

    #[tokio::test]
    async fn concurrent_calls_never_exceed_the_limit() {
        let (broker, subscription) = setup().await;
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (cur, max) = (current.clone(), peak.clone());
        let listener = Listener::new(subscription, move |_: Order, _: DeliveryMetadata| {
            let (cur, max) = (cur.clone(), max.clone());
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                ok()
            }
        })
        .with_max_concurrent_calls(2);

        for i in 0..10 {
            publish(&broker, request(&format!("customer-{i}"), 1)).await;
        }

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));
        wait_settled(&broker, 10).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(broker.completed(TOPIC, SUB).await.len(), 10);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency was {peak}");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_deliveries() {
        let (broker, subscription) = setup().await;
        let gate = Arc::new(Notify::new());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let handler_gate = gate.clone();
        let listener = Listener::new(subscription, move |_: Order, _: DeliveryMetadata| {
            let gate = handler_gate.clone();
            let started = started_tx.clone();
            async move {
                let _ = started.send(());
                gate.notified().await;
                ok()
            }
        })
        .with_max_concurrent_calls(1);
        let mut state = listener.state();
        assert_eq!(*state.borrow(), ListenerState::Idle);

        let first = publish(&broker, request("first", 1)).await;
        publish(&broker, request("second", 1)).await;

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        started_rx.recv().await.unwrap();
        cancel.cancel();
        state
            .wait_for(|s| *s == ListenerState::Stopping)
            .await
            .unwrap();
        assert!(!run.is_finished());

        gate.notify_one();
        run.await.unwrap().unwrap();

        assert_eq!(*state.borrow(), ListenerState::Stopped);
        assert_eq!(broker.completed(TOPIC, SUB).await, vec![first]);
        assert_eq!(broker.active_count(TOPIC, SUB).await, 1);
        assert_eq!(broker.locked_count(TOPIC, SUB).await, 0);
    }

    #[tokio::test]
    async fn broken_connection_is_a_fault() {
        let (broker, subscription) = setup().await;
        let listener = Listener::new(subscription, |_: Order, _: DeliveryMetadata| async { ok() });
        let mut state = listener.state();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));
        state
            .wait_for(|s| *s == ListenerState::Listening)
            .await
            .unwrap();

        broker.disconnect().await;
        let fault = run.await.unwrap().unwrap_err();

        assert!(matches!(fault.kind(), ListenerFaultKind::Receive(_)));
        assert_eq!(*state.borrow(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_loop() {
        let (broker, subscription) = setup().await;
        broker.set_lock_duration(Duration::from_millis(50)).await;
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let seen = attempts.clone();
        let listener = Listener::new(subscription, move |order: Order, metadata: DeliveryMetadata| {
            seen.lock()
                .unwrap()
                .push((order.customer_name.clone(), metadata.delivery_count));
            async move {
                if order.quantity == 0 && metadata.delivery_count == 1 {
                    panic!("cannot ship nothing");
                }
                ok()
            }
        });

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        let first = publish(&broker, request("empty", 0)).await;
        let second = publish(&broker, request("full", 2)).await;
        wait_settled(&broker, 2).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let mut completed = broker.completed(TOPIC, SUB).await;
        completed.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(completed, expected);
        assert_eq!(broker.locked_count(TOPIC, SUB).await, 0);

        let attempts = attempts.lock().unwrap();
        assert!(attempts.contains(&("empty".to_owned(), 1)));
        assert!(attempts.contains(&("empty".to_owned(), 2)));
    }

    #[derive(Default)]
    struct CountingHook {
        received: AtomicUsize,
        dead_lettered: AtomicUsize,
    }

    impl ListenerHook for Arc<CountingHook> {
        fn on_startup(&self, _: usize) {}
        fn on_shutdown(&self, _: usize) {}
        fn on_received(&self, _: &DeliveryMetadata) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn on_completed(&self, _: &DeliveryMetadata) {}
        fn on_dead_lettered(&self, _: &DeliveryMetadata, _: &str, _: &str) {
            self.dead_lettered.fetch_add(1, Ordering::SeqCst);
        }
        fn on_handler_error(&self, _: &DeliveryMetadata, _: &dyn std::error::Error) {}
        fn on_settle_error(&self, _: &DeliveryMetadata, _: &dyn std::error::Error) {}
        fn on_receive_error(&self, _: &dyn std::error::Error) {}
        fn on_stream_end(&self) {}
        fn on_task_panic(&self, _: &JoinError) {}
    }

    #[tokio::test]
    async fn custom_hook_observes_deliveries() {
        let (broker, subscription) = setup().await;
        let hook = Arc::new(CountingHook::default());
        let listener = Listener::new(subscription, |_: Order, _: DeliveryMetadata| async { ok() })
            .with_hook(hook.clone());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(listener.run(cancel.clone()));

        publish(&broker, request("Ada", 1)).await;
        send_raw(&broker, "text/xml", "xml-1", "<order/>").await;
        wait_settled(&broker, 2).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(hook.received.load(Ordering::SeqCst), 2);
        assert_eq!(hook.dead_lettered.load(Ordering::SeqCst), 1);
    }
}
