//! Message queues: envelope protocol, brokers, consumer and dead-letter
//! administration.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod redis;

pub use broker::{channel_queue_name, Broker, Delivery, QueueInfo, QueueTopology};
pub use consumer::{ConsumerSettings, MessageHandler, Outcome, QueueConsumer};
pub use dead_letter::{DeadLetterMonitor, DeadLetterService, PeekedMessage};
pub use envelope::{Envelope, HeaderValue};
pub use memory::InMemoryBroker;
pub use publisher::{publish_message, Publisher};
pub use self::redis::RedisBroker;
