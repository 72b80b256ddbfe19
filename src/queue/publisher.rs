//! Publish collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::envelope::Envelope;
use crate::error::BrokerError;

/// Puts an envelope on a named queue.
///
/// Publishing is fire-and-forget for the caller; durability comes from the
/// broker, which keeps every envelope marked persistent.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError> {
        (**self).publish(queue, envelope).await
    }
}

/// Serializes `message` to JSON and publishes it with empty headers.
pub async fn publish_message<P, T>(publisher: &P, queue: &str, message: &T) -> Result<(), BrokerError>
where
    P: Publisher + ?Sized,
    T: Serialize + ?Sized,
{
    let envelope = Envelope::from_message(message)?;
    publisher.publish(queue, envelope).await?;
    debug!(queue = %queue, "Published message");
    Ok(())
}
