//! Broker ports and backends.
//!
//! The publishing side only needs a [`Sender`](crate::transport::Sender).
//! The subscription side needs three capabilities, each expressed as its own
//! trait so a backend can be mocked one concern at a time:
//!
//! - [`ManageSubscriptions`]: check for and create durable subscriptions
//! - [`ReceiveMessages`]: stream deliveries for one subscription
//! - [`SettleMessages`]: complete, abandon or dead-letter a delivery
//!
//! Backends:
//!
//! - [`inmemory`]: in-process broker with full subscription semantics
//! - [`rabbitmq`]: RabbitMQ through `lapin` (feature-gated)

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{Envelope, Headers, transport::RawPayload};

/// Idle period after which the broker reclaims an unused subscription.
pub const DEFAULT_AUTO_DELETE_ON_IDLE: Duration = Duration::from_secs(25 * 60);

/// Number of deliveries after which the broker dead-letters a message.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 3;

/// Time-to-live applied to messages that do not set one.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Dead-letter reason used by brokers when the delivery cap is exhausted.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Durable subscription definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescription {
    pub topic: String,
    pub name: String,
    pub auto_delete_on_idle: Duration,
    pub max_delivery_count: u32,
}

impl SubscriptionDescription {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            auto_delete_on_idle: DEFAULT_AUTO_DELETE_ON_IDLE,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }

    pub fn with_auto_delete_on_idle(mut self, idle: Duration) -> Self {
        self.auto_delete_on_idle = idle;
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }
}

/// Result of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created the subscription first.
    AlreadyExists,
}

/// Trait for provisioning subscriptions.
#[async_trait::async_trait]
pub trait ManageSubscriptions {
    /// Backend-specific error type.
    type Error;

    /// Check whether `subscription` exists on `topic`.
    async fn subscription_exists(&self, topic: &str, subscription: &str)
    -> Result<bool, Self::Error>;

    /// Create a subscription.
    ///
    /// A duplicate create must be reported as
    /// [`CreateOutcome::AlreadyExists`], not as an error.
    async fn create_subscription(
        &self,
        description: &SubscriptionDescription,
    ) -> Result<CreateOutcome, Self::Error>;
}

/// Trait for receiving deliveries from a subscription.
///
/// The returned stream should:
/// - Yield deliveries as the broker hands them out
/// - End once the provided [`CancellationToken`] is cancelled
/// - Yield an error when the receive path breaks
#[async_trait::async_trait]
pub trait ReceiveMessages {
    /// Backend-specific error type.
    type Error;

    /// Stream deliveries until cancellation or failure.
    async fn messages(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error>;
}

/// Trait for settling deliveries.
///
/// Every delivery ends with exactly one of `complete` or `dead_letter`,
/// possibly after several `abandon`s.
#[async_trait::async_trait]
pub trait SettleMessages {
    /// Backend-specific error type.
    type Error;

    /// Remove the message from the subscription.
    async fn complete(&self, delivery: &Delivery) -> Result<(), Self::Error>;

    /// Give the message back to the broker for redelivery.
    async fn abandon(&self, delivery: &Delivery) -> Result<(), Self::Error>;

    /// Move the message to the subscription's dead-letter sub-queue.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> Result<(), Self::Error>;
}

/// One attempt to hand a message to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub envelope: Envelope<Headers, RawPayload>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Effective time-to-live, including the broker default.
    pub time_to_live: Duration,
    /// Backend handle used for settlement.
    pub lock_token: u64,
}

impl Delivery {
    pub fn metadata(&self) -> DeliveryMetadata {
        DeliveryMetadata {
            message_id: self.envelope.headers.message_id.clone(),
            label: self.envelope.headers.label.clone(),
            content_type: self.envelope.headers.content_type.clone(),
            time_to_live: self.time_to_live,
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Delivery properties handed to message handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub message_id: String,
    pub label: String,
    pub content_type: String,
    pub time_to_live: Duration,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Check a topic or subscription name.
///
/// Names are 1 to 50 characters of ASCII letters, digits, `.`, `-` and `_`,
/// and must start and end with a letter or digit.
pub fn validate_entity_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 50 {
        return Err(format!("`{name}` must be between 1 and 50 characters long"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(format!("`{name}` contains the invalid character `{c}`"));
    }
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(format!("`{name}` must start and end with a letter or digit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_defaults() {
        let description = SubscriptionDescription::new("orders", "billing");
        assert_eq!(description.auto_delete_on_idle, Duration::from_secs(1500));
        assert_eq!(description.max_delivery_count, 3);
    }

    #[test]
    fn entity_names() {
        assert!(validate_entity_name("orders").is_ok());
        assert!(validate_entity_name("order-events.v2_eu").is_ok());
        assert!(validate_entity_name("").is_err());
        assert!(validate_entity_name(&"a".repeat(51)).is_err());
        assert!(validate_entity_name("bad name").is_err());
        assert!(validate_entity_name("-leading").is_err());
        assert!(validate_entity_name("trailing.").is_err());
    }
}
