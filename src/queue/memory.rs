//! In-process broker.
//!
//! Same settlement, visibility timeout and dead-letter routing as the Redis
//! broker, held in memory. Used by tests and by `run --dry-run`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::broker::{
    Broker, Delivery, QueueInfo, QueueTopology, StoredMessage, DEFAULT_VISIBILITY_TIMEOUT,
};
use super::envelope::Envelope;
use super::publisher::Publisher;
use crate::error::BrokerError;

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    consumers: u32,
    dead_letter_exchange: Option<String>,
}

struct InFlight {
    queue: String,
    message: StoredMessage,
    delivered_at: Instant,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    /// Dead-letter exchange name to the queue bound to it.
    exchanges: HashMap<String, String>,
    in_flight: HashMap<u64, InFlight>,
    last_tag: u64,
}

impl State {
    fn info(&self, queue: &str) -> QueueInfo {
        let (message_count, consumer_count) = self
            .queues
            .get(queue)
            .map(|q| (q.messages.len() as u64, q.consumers))
            .unwrap_or((0, 0));
        QueueInfo {
            queue: queue.to_string(),
            message_count,
            consumer_count,
        }
    }

    fn take_in_flight(&mut self, queue: &str, tag: u64) -> Result<StoredMessage, BrokerError> {
        match self.in_flight.remove(&tag) {
            Some(entry) if entry.queue == queue => Ok(entry.message),
            Some(entry) => {
                self.in_flight.insert(tag, entry);
                Err(BrokerError::UnknownDeliveryTag {
                    queue: queue.to_string(),
                    delivery_tag: tag,
                })
            }
            None => Err(BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                delivery_tag: tag,
            }),
        }
    }
}

pub struct InMemoryBroker {
    state: Mutex<State>,
    visibility_timeout: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Number of ready messages in `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of delivered but unsettled messages across all queues.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Ready messages in `queue`, head first, without consuming them.
    pub async fn snapshot(&self, queue: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, queue: &str, mut envelope: Envelope) -> Result<(), BrokerError> {
        envelope.persistent = true;
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(StoredMessage::fresh(envelope));
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(state.info(queue))
    }

    async fn declare_with_dead_letter(
        &self,
        topology: &QueueTopology,
    ) -> Result<QueueInfo, BrokerError> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(topology.dead_letter_queue.clone())
            .or_default();
        state.exchanges.insert(
            topology.dead_letter_exchange.clone(),
            topology.dead_letter_queue.clone(),
        );
        state
            .queues
            .entry(topology.queue.clone())
            .or_default()
            .dead_letter_exchange = Some(topology.dead_letter_exchange.clone());
        Ok(state.info(&topology.queue))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
        else {
            return Ok(None);
        };

        state.last_tag += 1;
        let delivery_tag = state.last_tag;
        state.in_flight.insert(
            delivery_tag,
            InFlight {
                queue: queue.to_string(),
                message: message.clone(),
                delivered_at: Instant::now(),
            },
        );

        Ok(Some(Delivery {
            delivery_tag,
            queue: queue.to_string(),
            envelope: message.envelope,
            redelivered: message.redelivered,
        }))
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .take_in_flight(queue, delivery_tag)
            .map(|_| ())
    }

    async fn nack(
        &self,
        queue: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let mut message = state.take_in_flight(queue, delivery_tag)?;

        if requeue {
            message.redelivered = true;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .messages
                .push_front(message);
            return Ok(());
        }

        let target = state
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter_exchange.as_ref())
            .and_then(|exchange| state.exchanges.get(exchange))
            .cloned();

        match target {
            Some(dead_letter_queue) => {
                debug!(queue = %queue, dead_letter_queue = %dead_letter_queue, "Routing rejected message");
                state
                    .queues
                    .entry(dead_letter_queue)
                    .or_default()
                    .messages
                    .push_back(StoredMessage::fresh(message.envelope));
            }
            None => debug!(queue = %queue, "Discarding rejected message, no dead-letter binding"),
        }
        Ok(())
    }

    async fn requeue_expired(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| {
                entry.queue == queue && now.duration_since(entry.delivered_at) >= self.visibility_timeout
            })
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first, so the oldest delivery ends up at the head.
        expired.sort_unstable_by(|a, b| b.cmp(a));

        for tag in &expired {
            let mut message = state.take_in_flight(queue, *tag)?;
            message.redelivered = true;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .messages
                .push_front(message);
        }
        Ok(expired.len() as u64)
    }

    async fn purge(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        Ok(state.queues.get_mut(queue).map_or(0, |q| {
            let removed = q.messages.len() as u64;
            q.messages.clear();
            removed
        }))
    }

    async fn register_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default()
            .consumers += 1;
        Ok(())
    }

    async fn unregister_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        if let Some(q) = self.state.lock().await.queues.get_mut(queue) {
            q.consumers = q.consumers.saturating_sub(1);
        }
        Ok(())
    }
}
