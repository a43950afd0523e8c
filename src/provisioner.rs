//! Subscription provisioning.
//!
//! Listeners call [`ensure_subscription`] every time they start. The
//! exists-then-create sequence is racy when two listeners start at once:
//! both may observe the subscription as missing and both may try to create
//! it. The loser of that race gets [`CreateOutcome::AlreadyExists`] back from
//! the broker, which is treated as success.

use tracing_error::SpanTrace;

use crate::broker::{CreateOutcome, ManageSubscriptions, SubscriptionDescription};

/// How [`ensure_subscription`] found the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The subscription was already there.
    Existing,
    /// This call created it.
    Created,
    /// It was missing when checked, but another caller created it first.
    CreatedConcurrently,
}

/// Make sure the described subscription exists, creating it when absent.
///
/// Safe to call repeatedly with the same description.
#[tracing::instrument(skip_all, fields(topic = %description.topic, subscription = %description.name))]
pub async fn ensure_subscription<D>(
    manager: &D,
    description: &SubscriptionDescription,
) -> Result<Provisioned, ProvisioningError>
where
    D: ManageSubscriptions + Sync,
    D::Error: Into<tower::BoxError>,
{
    let exists = manager
        .subscription_exists(&description.topic, &description.name)
        .await
        .map_err(|e| ProvisioningError::check(e.into()))?;

    if exists {
        tracing::debug!("Subscription already exists");
        return Ok(Provisioned::Existing);
    }

    let outcome = manager
        .create_subscription(description)
        .await
        .map_err(|e| ProvisioningError::create(e.into()))?;

    match outcome {
        CreateOutcome::Created => {
            tracing::info!(
                auto_delete_on_idle = ?description.auto_delete_on_idle,
                max_delivery_count = description.max_delivery_count,
                "Subscription created"
            );
            Ok(Provisioned::Created)
        }
        CreateOutcome::AlreadyExists => {
            tracing::debug!("Subscription was created concurrently");
            Ok(Provisioned::CreatedConcurrently)
        }
    }
}

/// Error returned when a subscription cannot be provisioned.
#[derive(Debug)]
pub struct ProvisioningError {
    context: SpanTrace,
    kind: ProvisioningErrorKind,
}

/// Provisioning errors kind.
#[derive(Debug)]
pub enum ProvisioningErrorKind {
    /// The existence check failed.
    Check(tower::BoxError),
    /// The broker refused to create the subscription.
    Create(tower::BoxError),
}

impl ProvisioningError {
    fn check(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProvisioningErrorKind::Check(err),
        }
    }

    fn create(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProvisioningErrorKind::Create(err),
        }
    }

    pub fn kind(&self) -> &ProvisioningErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProvisioningErrorKind::Check(err) => {
                writeln!(f, "Failed to check subscription: {err}")
            }
            ProvisioningErrorKind::Create(err) => {
                writeln!(f, "Failed to create subscription: {err}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProvisioningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProvisioningErrorKind::Check(err) | ProvisioningErrorKind::Create(err) => {
                Some(err.as_ref())
            }
        }
    }
}
