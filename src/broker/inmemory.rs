use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Envelope, Headers,
    broker::{
        CreateOutcome, DEFAULT_TIME_TO_LIVE, Delivery, MAX_DELIVERY_COUNT_EXCEEDED,
        ManageSubscriptions, ReceiveMessages, SettleMessages, SubscriptionDescription,
        validate_entity_name,
    },
    transport::{RawPayload, Sender},
};

/// How long a delivery stays locked before the broker hands it out again.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);

/// Number of completed message ids kept per subscription for inspection.
pub const COMPLETION_LOG_CAPACITY: usize = 1024;

/// In-process broker for testing or single-process pipelines.
///
/// Implements the same topic and subscription semantics a hosted broker
/// offers:
///
/// - Every subscription of a topic receives its own copy of each message
/// - Received messages are locked until settled. A lock that is not settled
///   within the lock duration expires and the message becomes available
///   again, counted as a failed delivery attempt
/// - Abandoned messages are redelivered with an incremented delivery count,
///   and dead-lettered once the subscription's delivery cap is reached
/// - Expired messages are dropped instead of delivered
/// - Subscriptions idle for longer than their `auto_delete_on_idle` are
///   removed by [`reclaim_idle_subscriptions`](Self::reclaim_idle_subscriptions)
///
/// The broker can be [`disconnect`](Self::disconnect)ed to simulate a broken
/// connection. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    connected: bool,
    default_time_to_live: Duration,
    lock_duration: Duration,
    next_lock_token: u64,
    topics: HashMap<String, TopicState>,
}

#[derive(Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

struct SubscriptionState {
    description: SubscriptionDescription,
    active: VecDeque<StoredMessage>,
    locked: HashMap<u64, LockedMessage>,
    /// Tokens completed while their lock was still valid, with the lock's
    /// expiry. A repeated complete within that window succeeds.
    completed_tokens: HashMap<u64, Instant>,
    completed: VecDeque<String>,
    dead_letters: Vec<DeadLetter>,
    last_activity: Instant,
    notify: Arc<Notify>,
}

struct LockedMessage {
    message: StoredMessage,
    locked_until: Instant,
}

#[derive(Clone)]
struct StoredMessage {
    envelope: Envelope<Headers, RawPayload>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
    time_to_live: Duration,
    expires_at: Option<Instant>,
}

/// Message moved to a subscription's dead-letter sub-queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub envelope: Envelope<Headers, RawPayload>,
    pub reason: String,
    pub description: String,
    pub delivery_count: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connected: true,
                default_time_to_live: DEFAULT_TIME_TO_LIVE,
                lock_duration: DEFAULT_LOCK_DURATION,
                next_lock_token: 1,
                topics: HashMap::new(),
            })),
        }
    }

    /// Change the time-to-live given to messages that do not set one.
    pub async fn set_default_time_to_live(&self, ttl: Duration) {
        self.state.lock().await.default_time_to_live = ttl;
    }

    /// Change how long deliveries stay locked. Applies to new deliveries.
    pub async fn set_lock_duration(&self, lock_duration: Duration) {
        self.state.lock().await.lock_duration = lock_duration;
    }

    /// Create a topic if it does not exist yet.
    pub async fn create_topic(&self, topic: &str) -> Result<(), InMemoryBrokerError> {
        validate_entity_name(topic).map_err(InMemoryBrokerError::invalid_definition)?;
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.topics.entry(topic.to_owned()).or_default();
        Ok(())
    }

    /// Open a sender bound to `topic`.
    ///
    /// Fails when the broker is disconnected. The topic itself is resolved on
    /// every send.
    pub async fn topic_sender(&self, topic: &str) -> Result<InMemoryTopicSender, InMemoryBrokerError> {
        self.state.lock().await.ensure_connected()?;
        Ok(InMemoryTopicSender {
            broker: self.clone(),
            topic: topic.to_owned(),
        })
    }

    /// Handle used to receive and settle messages of one subscription.
    pub fn subscription(&self, topic: &str, subscription: &str) -> InMemorySubscription {
        InMemorySubscription {
            broker: self.clone(),
            topic: topic.to_owned(),
            name: subscription.to_owned(),
        }
    }

    /// Break the connection. Open receive streams yield an error and every
    /// other operation fails until [`reconnect`](Self::reconnect).
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.notify_all();
    }

    pub async fn reconnect(&self) {
        self.state.lock().await.connected = true;
    }

    /// Remove subscriptions that have been idle for longer than their
    /// `auto_delete_on_idle`. Returns the number of reclaimed subscriptions.
    pub async fn reclaim_idle_subscriptions(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut reclaimed = 0;
        for (topic, topic_state) in state.topics.iter_mut() {
            topic_state.subscriptions.retain(|name, sub| {
                let idle = now.saturating_duration_since(sub.last_activity);
                let keep = idle < sub.description.auto_delete_on_idle;
                if !keep {
                    tracing::info!(topic, subscription = name, ?idle, "Reclaiming idle subscription");
                    sub.notify.notify_waiters();
                    reclaimed += 1;
                }
                keep
            });
        }
        reclaimed
    }

    /// Number of subscriptions on `topic`.
    pub async fn subscription_count(&self, topic: &str) -> usize {
        let state = self.state.lock().await;
        state.topics.get(topic).map_or(0, |t| t.subscriptions.len())
    }

    /// Messages waiting to be delivered.
    pub async fn active_count(&self, topic: &str, subscription: &str) -> usize {
        self.inspect(topic, subscription, |s| s.active.len()).await
    }

    /// Messages currently delivered and not yet settled.
    pub async fn locked_count(&self, topic: &str, subscription: &str) -> usize {
        self.inspect(topic, subscription, |s| s.locked.len()).await
    }

    /// Message ids of the most recently completed messages, in completion
    /// order. At most [`COMPLETION_LOG_CAPACITY`] ids are kept.
    pub async fn completed(&self, topic: &str, subscription: &str) -> Vec<String> {
        self.inspect(topic, subscription, |s| s.completed.iter().cloned().collect())
            .await
    }

    /// Content of the dead-letter sub-queue.
    pub async fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<DeadLetter> {
        self.inspect(topic, subscription, |s| s.dead_letters.clone())
            .await
    }

    async fn inspect<T: Default>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&SubscriptionState) -> T,
    ) -> T {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(f)
            .unwrap_or_default()
    }

    #[tracing::instrument(skip(self, envelope), fields(message_id = %envelope.headers.message_id))]
    async fn publish(
        &self,
        topic: &str,
        envelope: Envelope<Headers, RawPayload>,
    ) -> Result<(), InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        let time_to_live = envelope
            .headers
            .time_to_live
            .unwrap_or(state.default_time_to_live);
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| InMemoryBrokerError::topic_not_found(topic))?;

        let message = StoredMessage {
            envelope,
            delivery_count: 0,
            enqueued_at: Utc::now(),
            time_to_live,
            expires_at: Instant::now().checked_add(time_to_live),
        };
        for sub in topic_state.subscriptions.values_mut() {
            sub.active.push_back(message.clone());
            sub.notify.notify_waiters();
        }
        tracing::debug!(
            subscriptions = topic_state.subscriptions.len(),
            "Message fanned out to subscriptions"
        );
        Ok(())
    }

    async fn lock_next(&self, topic: &str, subscription: &str) -> Result<Poll, InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        let lock_token = state.next_lock_token;
        state.next_lock_token += 1;
        let lock_duration = state.lock_duration;
        let sub = state.subscription_mut(topic, subscription)?;
        let now = Instant::now();
        sub.last_activity = now;
        sub.release_expired_locks(now);

        while let Some(mut message) = sub.active.pop_front() {
            if message.expires_at.is_some_and(|at| at <= now) {
                tracing::debug!(
                    message_id = %message.envelope.headers.message_id,
                    "Dropping expired message"
                );
                continue;
            }

            message.delivery_count += 1;
            let delivery = Delivery {
                envelope: message.envelope.clone(),
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at,
                time_to_live: message.time_to_live,
                lock_token,
            };
            sub.locked.insert(
                lock_token,
                LockedMessage {
                    message,
                    locked_until: now + lock_duration,
                },
            );
            return Ok(Poll::Delivery(delivery));
        }
        Ok(Poll::Idle {
            next_unlock: sub.locked.values().map(|l| l.locked_until).min(),
        })
    }

    async fn subscription_notify(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<Notify>, InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        let sub = state.subscription_mut(topic, subscription)?;
        sub.last_activity = Instant::now();
        Ok(Arc::clone(&sub.notify))
    }

    async fn settle(
        &self,
        topic: &str,
        subscription: &str,
        delivery: &Delivery,
        settlement: Settlement<'_>,
    ) -> Result<(), InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        let sub = state.subscription_mut(topic, subscription)?;
        let now = Instant::now();
        sub.last_activity = now;
        sub.release_expired_locks(now);
        let token = delivery.lock_token;

        let Some(LockedMessage {
            message,
            locked_until,
        }) = sub.locked.remove(&token)
        else {
            if matches!(settlement, Settlement::Complete) && sub.completed_tokens.contains_key(&token) {
                return Ok(());
            }
            return Err(InMemoryBrokerError::lock_lost(token));
        };

        match settlement {
            Settlement::Complete => {
                sub.completed_tokens.insert(token, locked_until);
                if sub.completed.len() == COMPLETION_LOG_CAPACITY {
                    sub.completed.pop_front();
                }
                sub.completed.push_back(message.envelope.headers.message_id);
            }
            Settlement::Abandon => sub.requeue(message),
            Settlement::DeadLetter {
                reason,
                description,
            } => {
                sub.dead_letters.push(DeadLetter {
                    reason: reason.to_owned(),
                    description: description.to_owned(),
                    delivery_count: message.delivery_count,
                    envelope: message.envelope,
                });
            }
        }
        Ok(())
    }
}

enum Poll {
    Delivery(Delivery),
    /// Nothing to deliver. `next_unlock` is the earliest lock expiry, when
    /// a locked message may become available again.
    Idle { next_unlock: Option<Instant> },
}

enum Settlement<'a> {
    Complete,
    Abandon,
    DeadLetter {
        reason: &'a str,
        description: &'a str,
    },
}

impl SubscriptionState {
    /// Return a message to the queue after a failed attempt, or dead-letter
    /// it once the delivery cap is reached.
    fn requeue(&mut self, message: StoredMessage) {
        if message.delivery_count >= self.description.max_delivery_count {
            tracing::warn!(
                message_id = %message.envelope.headers.message_id,
                delivery_count = message.delivery_count,
                "Delivery cap reached, dead-lettering message"
            );
            self.dead_letters.push(DeadLetter {
                description: format!(
                    "Message could not be consumed after {} delivery attempts",
                    message.delivery_count
                ),
                reason: MAX_DELIVERY_COUNT_EXCEEDED.to_owned(),
                delivery_count: message.delivery_count,
                envelope: message.envelope,
            });
        } else {
            self.active.push_front(message);
            self.notify.notify_waiters();
        }
    }

    fn release_expired_locks(&mut self, now: Instant) {
        self.completed_tokens.retain(|_, locked_until| *locked_until > now);

        let expired: Vec<u64> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(LockedMessage { message, .. }) = self.locked.remove(&token) {
                tracing::debug!(
                    message_id = %message.envelope.headers.message_id,
                    lock_token = token,
                    "Lock expired, releasing message"
                );
                self.requeue(message);
            }
        }
    }
}

impl BrokerState {
    fn ensure_connected(&self) -> Result<(), InMemoryBrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(InMemoryBrokerError::disconnected())
        }
    }

    fn subscription_mut(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<&mut SubscriptionState, InMemoryBrokerError> {
        self.topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| InMemoryBrokerError::subscription_not_found(topic, subscription))
    }

    fn notify_all(&self) {
        for topic in self.topics.values() {
            for sub in topic.subscriptions.values() {
                sub.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl ManageSubscriptions for InMemoryBroker {
    type Error = InMemoryBrokerError;

    async fn subscription_exists(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<bool, Self::Error> {
        let state = self.state.lock().await;
        state.ensure_connected()?;
        let topic_state = state
            .topics
            .get(topic)
            .ok_or_else(|| InMemoryBrokerError::topic_not_found(topic))?;
        Ok(topic_state.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(
        &self,
        description: &SubscriptionDescription,
    ) -> Result<CreateOutcome, Self::Error> {
        validate_entity_name(&description.name).map_err(InMemoryBrokerError::invalid_definition)?;
        if description.max_delivery_count == 0 {
            return Err(InMemoryBrokerError::invalid_definition(
                "max delivery count must be at least 1".to_owned(),
            ));
        }

        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        let topic_state = state
            .topics
            .get_mut(&description.topic)
            .ok_or_else(|| InMemoryBrokerError::topic_not_found(&description.topic))?;

        if topic_state.subscriptions.contains_key(&description.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        topic_state.subscriptions.insert(
            description.name.clone(),
            SubscriptionState {
                description: description.clone(),
                active: VecDeque::new(),
                locked: HashMap::new(),
                completed_tokens: HashMap::new(),
                completed: VecDeque::new(),
                dead_letters: Vec::new(),
                last_activity: Instant::now(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(CreateOutcome::Created)
    }
}

/// Sender bound to one topic of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryTopicSender {
    broker: InMemoryBroker,
    topic: String,
}

#[async_trait]
impl Sender<Headers, RawPayload> for InMemoryTopicSender {
    type Error = InMemoryBrokerError;

    /// Fan the envelope out to every subscription of the topic.
    async fn send(&mut self, envelope: Envelope<Headers, RawPayload>) -> Result<(), Self::Error> {
        self.broker.publish(&self.topic, envelope).await
    }
}

/// Receive and settle handle for one subscription of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemorySubscription {
    broker: InMemoryBroker,
    topic: String,
    name: String,
}

#[async_trait]
impl ReceiveMessages for InMemorySubscription {
    type Error = InMemoryBrokerError;

    /// Stream deliveries, waiting for new messages when the subscription is
    /// drained.
    ///
    /// Each yielded delivery is locked until it is settled.
    async fn messages(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error> {
        let notify = self.broker.subscription_notify(&self.topic, &self.name).await?;

        let stream = async_stream::stream! {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.broker.lock_next(&self.topic, &self.name).await {
                    Ok(Poll::Delivery(delivery)) => yield Ok(delivery),
                    Ok(Poll::Idle { next_unlock }) => {
                        let unlocked = async {
                            match next_unlock {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending().await,
                            }
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = &mut notified => {}
                            _ = unlocked => {}
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl SettleMessages for InMemorySubscription {
    type Error = InMemoryBrokerError;

    async fn complete(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.broker
            .settle(&self.topic, &self.name, delivery, Settlement::Complete)
            .await
    }

    async fn abandon(&self, delivery: &Delivery) -> Result<(), Self::Error> {
        self.broker
            .settle(&self.topic, &self.name, delivery, Settlement::Abandon)
            .await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> Result<(), Self::Error> {
        self.broker
            .settle(
                &self.topic,
                &self.name,
                delivery,
                Settlement::DeadLetter {
                    reason,
                    description,
                },
            )
            .await
    }
}

/// Error type for [`InMemoryBroker`] operations.
#[derive(Debug)]
pub struct InMemoryBrokerError {
    kind: InMemoryBrokerErrorKind,
}

/// Classification of in-memory broker errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InMemoryBrokerErrorKind {
    /// The broker connection was broken.
    Disconnected,
    TopicNotFound(String),
    SubscriptionNotFound { topic: String, subscription: String },
    /// The broker rejected an entity definition.
    InvalidDefinition(String),
    /// The delivery is not locked, or was already settled.
    LockLost(u64),
}

impl InMemoryBrokerError {
    fn disconnected() -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::Disconnected,
        }
    }

    fn topic_not_found(topic: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::TopicNotFound(topic.to_owned()),
        }
    }

    fn subscription_not_found(topic: &str, subscription: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::SubscriptionNotFound {
                topic: topic.to_owned(),
                subscription: subscription.to_owned(),
            },
        }
    }

    fn invalid_definition(reason: String) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::InvalidDefinition(reason),
        }
    }

    fn lock_lost(token: u64) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::LockLost(token),
        }
    }

    pub fn kind(&self) -> &InMemoryBrokerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InMemoryBrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryBrokerErrorKind::Disconnected => write!(f, "In-memory broker is disconnected"),
            InMemoryBrokerErrorKind::TopicNotFound(topic) => {
                write!(f, "Topic `{topic}` does not exist")
            }
            InMemoryBrokerErrorKind::SubscriptionNotFound {
                topic,
                subscription,
            } => write!(f, "Subscription `{subscription}` does not exist on topic `{topic}`"),
            InMemoryBrokerErrorKind::InvalidDefinition(reason) => {
                write!(f, "Invalid entity definition: {reason}")
            }
            InMemoryBrokerErrorKind::LockLost(token) => {
                write!(f, "Delivery {token} is not locked by this receiver")
            }
        }
    }
}

impl std::error::Error for InMemoryBrokerError {}
