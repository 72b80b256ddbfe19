//! Redis-backed broker.
//!
//! Keys:
//! - `mq:queue:{name}`: ready messages (list, head is next)
//! - `mq:inflight:{name}`: delivered, unsettled messages (hash, tag to message)
//! - `mq:inflight_at:{name}`: delivery time of each in-flight tag (sorted set, epoch ms)
//! - `mq:dlx:{name}`: dead-letter exchange bound to a main queue
//! - `mq:exchange:{name}`: queue bound to a dead-letter exchange
//! - `mq:consumers:{name}`: running consumer count
//! - `mq:queues`: declared queue names
//! - `mq:delivery_tag`: delivery tag counter

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::broker::{
    Broker, Delivery, QueueInfo, QueueTopology, StoredMessage, DEFAULT_VISIBILITY_TIMEOUT,
};
use super::envelope::Envelope;
use super::publisher::Publisher;
use crate::error::BrokerError;

const QUEUE_PREFIX: &str = "mq:queue:";
const IN_FLIGHT_PREFIX: &str = "mq:inflight:";
const IN_FLIGHT_AT_PREFIX: &str = "mq:inflight_at:";
const DLX_BINDING_PREFIX: &str = "mq:dlx:";
const EXCHANGE_PREFIX: &str = "mq:exchange:";
const CONSUMERS_PREFIX: &str = "mq:consumers:";
const QUEUES_KEY: &str = "mq:queues";
const DELIVERY_TAG_KEY: &str = "mq:delivery_tag";

/// Pops the head of a queue into the in-flight hash under a new tag and
/// records the delivery time (ARGV[1], epoch ms).
const GET_SCRIPT: &str = r"
local message = redis.call('LPOP', KEYS[1])
if not message then
  return nil
end
local tag = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[2], tag, message)
redis.call('ZADD', KEYS[4], ARGV[1], tag)
return {tag, message}
";

/// Removes an in-flight entry and optionally pushes a message elsewhere.
/// Returns 0 if the tag was not in flight.
const SETTLE_SCRIPT: &str = r"
redis.call('ZREM', KEYS[3], ARGV[1])
if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[2] == 'head' then
  redis.call('LPUSH', KEYS[2], ARGV[3])
elseif ARGV[2] == 'tail' then
  redis.call('RPUSH', KEYS[2], ARGV[3])
end
return 1
";

/// Opens a managed Redis connection.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, BrokerError> {
    let client = redis::Client::open(redis_url).map_err(|e| BrokerError::ConnectionFailed {
        url: redis_url.to_string(),
        message: e.to_string(),
    })?;

    client
        .get_connection_manager()
        .await
        .map_err(|e| BrokerError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })
}

#[derive(Clone)]
pub struct RedisBroker {
    connection: ConnectionManager,
    get_script: Script,
    settle_script: Script,
    visibility_timeout: Duration,
}

impl RedisBroker {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            get_script: Script::new(GET_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Connects to `redis_url` and returns a broker over that connection.
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let connection = connect(redis_url).await?;
        info!("Connected to Redis broker");
        Ok(Self::new(connection))
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn queue_key(queue: &str) -> String {
        format!("{}{}", QUEUE_PREFIX, queue)
    }

    fn in_flight_key(queue: &str) -> String {
        format!("{}{}", IN_FLIGHT_PREFIX, queue)
    }

    fn in_flight_at_key(queue: &str) -> String {
        format!("{}{}", IN_FLIGHT_AT_PREFIX, queue)
    }

    async fn queue_info(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let (message_count, consumers): (u64, Option<i64>) = redis::pipe()
            .llen(Self::queue_key(queue))
            .get(format!("{}{}", CONSUMERS_PREFIX, queue))
            .query_async(&mut self.connection.clone())
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        Ok(QueueInfo {
            queue: queue.to_string(),
            message_count,
            consumer_count: consumers.unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32,
        })
    }

    /// Runs the settle script. `placement` is `head`, `tail` or `drop`.
    async fn settle(
        &self,
        queue: &str,
        delivery_tag: u64,
        destination: &str,
        placement: &str,
        payload: &str,
    ) -> Result<(), BrokerError> {
        let settled: i64 = self
            .settle_script
            .key(Self::in_flight_key(queue))
            .key(Self::queue_key(destination))
            .key(Self::in_flight_at_key(queue))
            .arg(delivery_tag)
            .arg(placement)
            .arg(payload)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| BrokerError::SettleFailed {
                queue: queue.to_string(),
                delivery_tag,
                message: e.to_string(),
            })?;

        if settled == 0 {
            return Err(BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                delivery_tag,
            });
        }
        Ok(())
    }

    async fn in_flight_message(
        &self,
        queue: &str,
        delivery_tag: u64,
    ) -> Result<StoredMessage, BrokerError> {
        let raw: Option<String> = self
            .connection
            .clone()
            .hget(Self::in_flight_key(queue), delivery_tag)
            .await
            .map_err(|e| BrokerError::SettleFailed {
                queue: queue.to_string(),
                delivery_tag,
                message: e.to_string(),
            })?;

        raw.map(decode).ok_or_else(|| BrokerError::UnknownDeliveryTag {
            queue: queue.to_string(),
            delivery_tag,
        })
    }

    async fn dead_letter_target(&self, queue: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.connection.clone();
        let map_err = |e: redis::RedisError| BrokerError::ReceiveFailed {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        let exchange: Option<String> = conn
            .get(format!("{}{}", DLX_BINDING_PREFIX, queue))
            .await
            .map_err(map_err)?;
        let Some(exchange) = exchange else {
            return Ok(None);
        };

        conn.get(format!("{}{}", EXCHANGE_PREFIX, exchange))
            .await
            .map_err(map_err)
    }
}

/// Foreign payloads become a bare body so the consumer can apply its
/// malformed-message handling.
fn decode(raw: String) -> StoredMessage {
    match serde_json::from_str(&raw) {
        Ok(stored) => stored,
        Err(_) => StoredMessage::fresh(Envelope::new(raw)),
    }
}

fn encode(message: &StoredMessage) -> Result<String, BrokerError> {
    serde_json::to_string(message).map_err(|e| BrokerError::SerializationFailed(e.to_string()))
}

#[async_trait]
impl Publisher for RedisBroker {
    async fn publish(&self, queue: &str, mut envelope: Envelope) -> Result<(), BrokerError> {
        envelope.persistent = true;
        let payload = encode(&StoredMessage::fresh(envelope))?;

        self.connection
            .clone()
            .rpush::<_, _, ()>(Self::queue_key(queue), payload)
            .await
            .map_err(|e| BrokerError::PublishFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        self.connection
            .clone()
            .sadd::<_, _, ()>(QUEUES_KEY, queue)
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        self.queue_info(queue).await
    }

    async fn declare_with_dead_letter(
        &self,
        topology: &QueueTopology,
    ) -> Result<QueueInfo, BrokerError> {
        redis::pipe()
            .atomic()
            .sadd(QUEUES_KEY, &topology.queue)
            .ignore()
            .sadd(QUEUES_KEY, &topology.dead_letter_queue)
            .ignore()
            .set(
                format!("{}{}", EXCHANGE_PREFIX, topology.dead_letter_exchange),
                &topology.dead_letter_queue,
            )
            .ignore()
            .set(
                format!("{}{}", DLX_BINDING_PREFIX, topology.queue),
                &topology.dead_letter_exchange,
            )
            .ignore()
            .query_async::<_, ()>(&mut self.connection.clone())
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                queue: topology.queue.clone(),
                message: e.to_string(),
            })?;

        debug!(
            queue = %topology.queue,
            dead_letter_exchange = %topology.dead_letter_exchange,
            dead_letter_queue = %topology.dead_letter_queue,
            "Declared queue with dead-letter binding"
        );
        self.queue_info(&topology.queue).await
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let popped: Option<(u64, String)> = self
            .get_script
            .key(Self::queue_key(queue))
            .key(Self::in_flight_key(queue))
            .key(DELIVERY_TAG_KEY)
            .key(Self::in_flight_at_key(queue))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| BrokerError::ReceiveFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        let Some((delivery_tag, raw)) = popped else {
            return Ok(None);
        };

        let stored = decode(raw);

        Ok(Some(Delivery {
            delivery_tag,
            queue: queue.to_string(),
            envelope: stored.envelope,
            redelivered: stored.redelivered,
        }))
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        self.settle(queue, delivery_tag, queue, "drop", "").await
    }

    async fn nack(
        &self,
        queue: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let mut message = self.in_flight_message(queue, delivery_tag).await?;

        if requeue {
            message.redelivered = true;
            return self
                .settle(queue, delivery_tag, queue, "head", &encode(&message)?)
                .await;
        }

        match self.dead_letter_target(queue).await? {
            Some(dead_letter_queue) => {
                let payload = encode(&StoredMessage::fresh(message.envelope))?;
                self.settle(queue, delivery_tag, &dead_letter_queue, "tail", &payload)
                    .await
            }
            None => {
                debug!(queue = %queue, "Discarding rejected message, no dead-letter binding");
                self.settle(queue, delivery_tag, queue, "drop", "").await
            }
        }
    }

    async fn requeue_expired(&self, queue: &str) -> Result<u64, BrokerError> {
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(timeout_ms);

        let tags: Vec<u64> = self
            .connection
            .clone()
            .zrangebyscore(Self::in_flight_at_key(queue), "-inf", cutoff)
            .await
            .map_err(|e| BrokerError::ReceiveFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        let mut requeued = 0;
        // Newest first, so the oldest delivery ends up at the head.
        for delivery_tag in tags.into_iter().rev() {
            let mut message = match self.in_flight_message(queue, delivery_tag).await {
                Ok(message) => message,
                // Settled since the range was read; drops any stale score.
                Err(BrokerError::UnknownDeliveryTag { .. }) => {
                    self.settle(queue, delivery_tag, queue, "drop", "").await.ok();
                    continue;
                }
                Err(e) => return Err(e),
            };
            message.redelivered = true;

            match self
                .settle(queue, delivery_tag, queue, "head", &encode(&message)?)
                .await
            {
                Ok(()) => requeued += 1,
                Err(BrokerError::UnknownDeliveryTag { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(requeued)
    }

    async fn purge(&self, queue: &str) -> Result<u64, BrokerError> {
        let key = Self::queue_key(queue);
        let (removed, _): (u64, i64) = redis::pipe()
            .atomic()
            .llen(&key)
            .del(&key)
            .query_async(&mut self.connection.clone())
            .await
            .map_err(|e| BrokerError::PurgeFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(removed)
    }

    async fn register_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        self.connection
            .clone()
            .incr::<_, _, ()>(format!("{}{}", CONSUMERS_PREFIX, queue), 1)
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }

    async fn unregister_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        self.connection
            .clone()
            .decr::<_, _, ()>(format!("{}{}", CONSUMERS_PREFIX, queue), 1)
            .await
            .map_err(|e| BrokerError::DeclareFailed {
                queue: queue.to_string(),
                message: e.to_string(),
            })
    }
}
