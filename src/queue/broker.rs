//! Broker abstraction and queue naming.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::publisher::Publisher;
use crate::delivery::ChannelKind;
use crate::error::BrokerError;

const DEAD_LETTER_QUEUE_SUFFIX: &str = "-dlq";
const DEAD_LETTER_EXCHANGE_SUFFIX: &str = "-dlx";

/// Main queue name for a delivery channel: `{channel}-notifications`.
pub fn channel_queue_name(kind: ChannelKind) -> String {
    format!("{kind}-notifications")
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_QUEUE_SUFFIX}")
}

pub fn dead_letter_exchange_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_EXCHANGE_SUFFIX}")
}

/// Returns true if `name` follows the dead-letter queue or exchange naming.
pub fn is_dead_letter_name(name: &str) -> bool {
    name.ends_with(DEAD_LETTER_QUEUE_SUFFIX) || name.ends_with(DEAD_LETTER_EXCHANGE_SUFFIX)
}

/// A main queue together with its dead-letter exchange and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl QueueTopology {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            dead_letter_exchange: dead_letter_exchange_name(&queue),
            dead_letter_queue: dead_letter_queue_name(&queue),
            queue,
        }
    }
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u64,
    pub consumer_count: u32,
}

/// A message taken from a queue and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub envelope: Envelope,
    /// True when the message was returned to the queue by a requeueing nack
    /// or after its visibility timeout expired.
    pub redelivered: bool,
}

/// How long a delivery may stay unsettled before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Form in which brokers keep queued and in-flight messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub envelope: Envelope,
    #[serde(default)]
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn fresh(envelope: Envelope) -> Self {
        Self {
            envelope,
            redelivered: false,
        }
    }
}

/// Queue operations the pipeline needs from a message broker.
///
/// Every delivery returned by [`get`](Broker::get) must be settled with
/// exactly one [`ack`](Broker::ack) or [`nack`](Broker::nack).
#[async_trait]
pub trait Broker: Publisher {
    /// Declares `queue` if missing. Safe to repeat.
    async fn declare_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError>;

    /// Declares the main queue, its dead-letter exchange and dead-letter
    /// queue, and routes rejected messages from the former to the latter.
    async fn declare_with_dead_letter(
        &self,
        topology: &QueueTopology,
    ) -> Result<QueueInfo, BrokerError>;

    /// Takes the next message without acknowledging it.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery. With `requeue` the message goes back to the head
    /// of its queue, otherwise it is routed to the bound dead-letter queue
    /// (or discarded if none is bound).
    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool)
        -> Result<(), BrokerError>;

    /// Returns deliveries from `queue` that have stayed unsettled longer than
    /// the visibility timeout to the head of the queue, marked redelivered.
    /// Returns how many were moved.
    ///
    /// A consumer that dies mid-handler leaves its delivery in flight; this
    /// is what makes it available again.
    async fn requeue_expired(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Deletes every ready message in `queue`, returning how many were removed.
    async fn purge(&self, queue: &str) -> Result<u64, BrokerError>;

    async fn register_consumer(&self, queue: &str) -> Result<(), BrokerError>;

    async fn unregister_consumer(&self, queue: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
