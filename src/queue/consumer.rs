//! Generic queue consumer.
//!
//! One [`QueueConsumer`] drives one queue: it receives envelopes one at a
//! time, hands the decoded message to a [`MessageHandler`], and settles the
//! delivery according to the retry-count protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, Delivery, QueueInfo, QueueTopology};
use crate::config::model::{ConsumerConfig, MalformedPolicy, RetryConfig};
use crate::delivery::status::{mark_failed_best_effort, DispatchTarget, StatusUpdater};
use crate::error::{BrokerError, DeliveryError};
use crate::notify::Metrics;
use crate::retry::ProcessingMiddleware;

/// Business logic for one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: DeserializeOwned + Send + Sync;

    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn process(
        &self,
        message: &Self::Message,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>;

    /// The dispatch to mark Failed when `message` is dead-lettered.
    fn correlation_ids(&self, _message: &Self::Message) -> Option<DispatchTarget> {
        None
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Republished with `retry_count` in its header.
    Retrying { retry_count: u32 },
    DeadLettered,
    Malformed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Retrying { .. } => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Total queue-level attempts, including the first.
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub on_malformed: MalformedPolicy,
    /// Dead-letter non-transient failures without spending the retry budget.
    pub fail_fast_terminal: bool,
    /// How often the loop returns expired in-flight deliveries to the queue.
    pub requeue_interval: Duration,
}

impl ConsumerSettings {
    pub fn from_config(retry: &RetryConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            max_attempts: retry.max_attempts,
            poll_interval: Duration::from_millis(consumer.poll_interval_ms),
            on_malformed: consumer.on_malformed,
            fail_fast_terminal: retry.fail_fast_terminal,
            requeue_interval: Duration::from_secs(consumer.requeue_interval_seconds),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            on_malformed: MalformedPolicy::Drop,
            fail_fast_terminal: false,
            requeue_interval: Duration::from_secs(60),
        }
    }
}

pub struct QueueConsumer<B: ?Sized, H> {
    broker: Arc<B>,
    handler: Arc<H>,
    topology: QueueTopology,
    settings: ConsumerSettings,
    middleware: Option<ProcessingMiddleware>,
    failure_marker: Option<Arc<dyn StatusUpdater>>,
    metrics: Option<Arc<Metrics>>,
}

impl<B, H> QueueConsumer<B, H>
where
    B: Broker + ?Sized,
    H: MessageHandler,
{
    pub fn new(
        broker: Arc<B>,
        handler: Arc<H>,
        queue: impl Into<String>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            broker,
            handler,
            topology: QueueTopology::for_queue(queue),
            settings,
            middleware: None,
            failure_marker: None,
            metrics: None,
        }
    }

    /// Wraps every handler call in bounded in-process retries.
    pub fn with_middleware(mut self, middleware: ProcessingMiddleware) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Marks the message's dispatch Failed when it is dead-lettered.
    pub fn with_failure_marker(mut self, updater: Arc<dyn StatusUpdater>) -> Self {
        self.failure_marker = Some(updater);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn queue(&self) -> &str {
        &self.topology.queue
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    pub async fn declare(&self) -> Result<QueueInfo, BrokerError> {
        self.broker.declare_with_dead_letter(&self.topology).await
    }

    /// Returns deliveries abandoned past the visibility timeout to the queue.
    pub async fn requeue_expired(&self) -> Result<u64, BrokerError> {
        let requeued = self.broker.requeue_expired(self.queue()).await?;
        if requeued > 0 {
            warn!(
                queue = %self.queue(),
                requeued,
                "Requeued deliveries past their visibility timeout"
            );
        }
        Ok(requeued)
    }

    /// Receives and handles at most one message.
    pub async fn poll_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Outcome>, BrokerError> {
        match self.broker.get(self.queue()).await? {
            Some(delivery) => self.handle_delivery(delivery, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs the receive loop until `cancel` fires.
    ///
    /// Cancellation is checked between messages; a message already being
    /// handled is settled before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let info = self.declare().await?;
        self.broker.register_consumer(self.queue()).await?;
        info!(
            queue = %self.queue(),
            handler = %self.handler.name(),
            pending = info.message_count,
            "Consumer started"
        );

        let mut next_requeue = tokio::time::Instant::now();
        while !cancel.is_cancelled() {
            if tokio::time::Instant::now() >= next_requeue {
                if let Err(e) = self.requeue_expired().await {
                    error!(queue = %self.queue(), error = %e, "Failed to requeue expired deliveries");
                }
                next_requeue = tokio::time::Instant::now() + self.settings.requeue_interval;
            }

            let idle = match self.poll_once(&cancel).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(queue = %self.queue(), error = %e, "Receive loop error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }

        if let Err(e) = self.broker.unregister_consumer(self.queue()).await {
            warn!(queue = %self.queue(), error = %e, "Failed to unregister consumer");
        }
        info!(queue = %self.queue(), "Consumer stopped");
        Ok(())
    }

    /// Decodes, handles and settles one delivery.
    pub async fn handle_delivery(
        &self,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<Outcome, BrokerError> {
        let retry_count = delivery.envelope.retry_count();

        let message: H::Message = match delivery.envelope.decode() {
            Ok(message) => message,
            Err(e) => return self.reject_malformed(&delivery, e).await,
        };

        debug!(
            queue = %self.queue(),
            delivery_tag = delivery.delivery_tag,
            retry_count,
            redelivered = delivery.redelivered,
            "Received message"
        );

        let started = Instant::now();
        let result = self.invoke(&message, cancel).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_handler_duration(self.queue(), started.elapsed().as_secs_f64());
        }

        let outcome = match result {
            Ok(()) => {
                self.broker.ack(self.queue(), delivery.delivery_tag).await?;
                debug!(queue = %self.queue(), delivery_tag = delivery.delivery_tag, "Message processed");
                Outcome::Succeeded
            }
            Err(e) => {
                self.handle_failure(&delivery, &message, retry_count, e)
                    .await?
            }
        };

        self.record(outcome);
        Ok(outcome)
    }

    async fn invoke(
        &self,
        message: &H::Message,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let handler = &*self.handler;
        match &self.middleware {
            Some(middleware) => {
                middleware
                    .execute(move |_| handler.process(message, cancel), cancel)
                    .await
            }
            None => handler.process(message, cancel).await,
        }
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        message: &H::Message,
        retry_count: u32,
        error: DeliveryError,
    ) -> Result<Outcome, BrokerError> {
        let queue = self.queue();
        let terminal = self.settings.fail_fast_terminal && !error.kind().is_transient();
        let within_budget = retry_count < self.settings.max_attempts.saturating_sub(1);

        if within_budget && !terminal {
            let next = delivery.envelope.next_attempt();
            if let Err(publish_error) = self.broker.publish(queue, next).await {
                error!(
                    queue = %queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %publish_error,
                    "Retry republish failed, returning message to queue"
                );
                self.broker.nack(queue, delivery.delivery_tag, true).await?;
                return Err(publish_error);
            }
            self.broker.ack(queue, delivery.delivery_tag).await?;

            warn!(
                queue = %queue,
                attempt = retry_count + 1,
                max_attempts = self.settings.max_attempts,
                kind = %error.kind(),
                error = %error,
                "Message processing failed, requeued for retry attempt {}",
                retry_count + 2
            );
            return Ok(Outcome::Retrying {
                retry_count: retry_count + 1,
            });
        }

        error!(
            queue = %queue,
            retry_count,
            max_attempts = self.settings.max_attempts,
            kind = %error.kind(),
            error = %error,
            "Message processing failed after all retry attempts, dead-lettering"
        );

        if let (Some(updater), Some(target)) =
            (&self.failure_marker, self.handler.correlation_ids(message))
        {
            mark_failed_best_effort(updater.as_ref(), &target, &error).await;
        }

        self.broker.nack(queue, delivery.delivery_tag, false).await?;
        Ok(Outcome::DeadLettered)
    }

    async fn reject_malformed(
        &self,
        delivery: &Delivery,
        error: serde_json::Error,
    ) -> Result<Outcome, BrokerError> {
        match self.settings.on_malformed {
            MalformedPolicy::Drop => {
                warn!(
                    queue = %self.queue(),
                    delivery_tag = delivery.delivery_tag,
                    error = %error,
                    "Dropping malformed message"
                );
                self.broker.ack(self.queue(), delivery.delivery_tag).await?;
            }
            MalformedPolicy::DeadLetter => {
                warn!(
                    queue = %self.queue(),
                    delivery_tag = delivery.delivery_tag,
                    error = %error,
                    "Dead-lettering malformed message"
                );
                self.broker
                    .nack(self.queue(), delivery.delivery_tag, false)
                    .await?;
            }
        }

        self.record(Outcome::Malformed);
        Ok(Outcome::Malformed)
    }

    fn record(&self, outcome: Outcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_message(self.queue(), outcome.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;
    use crate::delivery::status::MockStatusUpdater;
    use crate::delivery::{ChannelKind, NotificationStatus};
    use crate::error::StoreError;
    use crate::queue::envelope::{Envelope, HeaderValue, RETRY_COUNT_HEADER};
    use crate::queue::memory::InMemoryBroker;
    use crate::queue::publisher::{publish_message, Publisher};
    use crate::retry::ExponentialBackoff;

    const QUEUE: &str = "sms-notifications";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: u32,
        target: Option<DispatchTarget>,
    }

    struct TestHandler {
        calls: AtomicU32,
        failures_before_success: u32,
        error: fn() -> DeliveryError,
        stop_after: Option<(u32, CancellationToken)>,
    }

    impl TestHandler {
        fn succeeding() -> Self {
            Self::failing(0, || DeliveryError::Internal("unused".into()))
        }

        fn failing(times: u32, error: fn() -> DeliveryError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success: times,
                error,
                stop_after: None,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for TestHandler {
        type Message = Ping;

        fn name(&self) -> &str {
            "test"
        }

        async fn process(
            &self,
            _message: &Ping,
            _cancel: &CancellationToken,
        ) -> Result<(), DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.stop_after {
                if call >= *limit {
                    token.cancel();
                }
            }
            if call <= self.failures_before_success {
                Err((self.error)())
            } else {
                Ok(())
            }
        }

        fn correlation_ids(&self, message: &Ping) -> Option<DispatchTarget> {
            message.target
        }
    }

    fn transient() -> DeliveryError {
        DeliveryError::Network("connection reset".into())
    }

    fn terminal() -> DeliveryError {
        DeliveryError::InvalidPayload("missing recipient".into())
    }

    fn dispatch_target() -> DispatchTarget {
        DispatchTarget {
            notification_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            channel: ChannelKind::Sms,
        }
    }

    async fn setup(
        handler: TestHandler,
        settings: ConsumerSettings,
    ) -> (
        Arc<InMemoryBroker>,
        Arc<TestHandler>,
        QueueConsumer<InMemoryBroker, TestHandler>,
    ) {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Arc::new(handler);
        let consumer = QueueConsumer::new(broker.clone(), handler.clone(), QUEUE, settings);
        consumer.declare().await.unwrap();
        (broker, handler, consumer)
    }

    async fn publish_with_count(broker: &InMemoryBroker, ping: &Ping, retry_count: i64) {
        let envelope = Envelope::from_message(ping)
            .unwrap()
            .with_header(RETRY_COUNT_HEADER, HeaderValue::Int(retry_count));
        broker.publish(QUEUE, envelope).await.unwrap();
    }

    #[tokio::test]
    async fn success_acknowledges_delivery() {
        let (broker, handler, consumer) =
            setup(TestHandler::succeeding(), ConsumerSettings::default()).await;
        publish_message(broker.as_ref(), QUEUE, &Ping { id: 1, target: None })
            .await
            .unwrap();

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::Succeeded));
        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.in_flight().await, 0);
        assert_eq!(broker.depth(QUEUE).await, 0);
    }

    #[tokio::test]
    async fn empty_queue_yields_nothing() {
        let (_broker, handler, consumer) =
            setup(TestHandler::succeeding(), ConsumerSettings::default()).await;

        assert_eq!(
            consumer.poll_once(&CancellationToken::new()).await.unwrap(),
            None
        );
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn failure_within_budget_republishes_with_incremented_count() {
        let (broker, _handler, consumer) =
            setup(TestHandler::failing(1, transient), ConsumerSettings::default()).await;
        publish_with_count(&broker, &Ping { id: 7, target: None }, 1).await;

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::Retrying { retry_count: 2 }));
        assert_eq!(broker.in_flight().await, 0);
        let queued = broker.snapshot(QUEUE).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count(), 2);
        assert!(broker
            .snapshot(&consumer.topology().dead_letter_queue)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_and_marks_failed() {
        let target = dispatch_target();
        let mut updater = MockStatusUpdater::new();
        updater
            .expect_update_channel_status()
            .withf(move |t, status, _| *t == target && *status == NotificationStatus::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (broker, _handler, consumer) =
            setup(TestHandler::failing(1, transient), ConsumerSettings::default()).await;
        let consumer = consumer.with_failure_marker(Arc::new(updater));
        publish_with_count(&broker, &Ping { id: 3, target: Some(target) }, 2).await;

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::DeadLettered));
        assert_eq!(broker.depth(QUEUE).await, 0);
        let dead = broker.snapshot(&consumer.topology().dead_letter_queue).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count(), 2);
    }

    #[tokio::test]
    async fn marker_errors_never_block_dead_lettering() {
        let mut updater = MockStatusUpdater::new();
        updater
            .expect_update_channel_status()
            .times(1)
            .returning(|_, _, _| Err(StoreError::WriteFailed("timeout".into())));

        let (broker, _handler, consumer) =
            setup(TestHandler::failing(1, transient), ConsumerSettings::default()).await;
        let consumer = consumer.with_failure_marker(Arc::new(updater));
        publish_with_count(
            &broker,
            &Ping {
                id: 4,
                target: Some(dispatch_target()),
            },
            5,
        )
        .await;

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::DeadLettered));
        assert_eq!(
            broker
                .snapshot(&consumer.topology().dead_letter_queue)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn terminal_failures_use_budget_unless_fail_fast() {
        let (broker, _handler, consumer) =
            setup(TestHandler::failing(1, terminal), ConsumerSettings::default()).await;
        publish_message(broker.as_ref(), QUEUE, &Ping { id: 1, target: None })
            .await
            .unwrap();
        assert_eq!(
            consumer.poll_once(&CancellationToken::new()).await.unwrap(),
            Some(Outcome::Retrying { retry_count: 1 })
        );

        let settings = ConsumerSettings {
            fail_fast_terminal: true,
            ..ConsumerSettings::default()
        };
        let (broker, _handler, consumer) = setup(TestHandler::failing(1, terminal), settings).await;
        publish_message(broker.as_ref(), QUEUE, &Ping { id: 2, target: None })
            .await
            .unwrap();
        assert_eq!(
            consumer.poll_once(&CancellationToken::new()).await.unwrap(),
            Some(Outcome::DeadLettered)
        );
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_by_default() {
        let (broker, handler, consumer) =
            setup(TestHandler::succeeding(), ConsumerSettings::default()).await;
        broker.publish(QUEUE, Envelope::new("not json")).await.unwrap();

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::Malformed));
        assert_eq!(handler.calls(), 0);
        assert_eq!(broker.in_flight().await, 0);
        assert!(broker
            .snapshot(&consumer.topology().dead_letter_queue)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_can_be_dead_lettered() {
        let settings = ConsumerSettings {
            on_malformed: MalformedPolicy::DeadLetter,
            ..ConsumerSettings::default()
        };
        let (broker, _handler, consumer) = setup(TestHandler::succeeding(), settings).await;
        broker.publish(QUEUE, Envelope::new("{\"id\":")).await.unwrap();

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::Malformed));
        assert_eq!(
            broker
                .snapshot(&consumer.topology().dead_letter_queue)
                .await
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn middleware_retries_before_queue_tier() {
        let (broker, handler, consumer) =
            setup(TestHandler::failing(2, transient), ConsumerSettings::default()).await;
        let consumer = consumer.with_middleware(ProcessingMiddleware::new(Arc::new(
            ExponentialBackoff::new(3, Duration::from_millis(100), Duration::from_secs(1)),
        )));
        publish_message(broker.as_ref(), QUEUE, &Ping { id: 9, target: None })
            .await
            .unwrap();

        let outcome = consumer.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, Some(Outcome::Succeeded));
        assert_eq!(handler.calls(), 3);
        assert_eq!(broker.depth(QUEUE).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let handler = TestHandler {
            stop_after: Some((2, cancel.clone())),
            ..TestHandler::succeeding()
        };
        let (broker, handler, consumer) = setup(handler, ConsumerSettings::default()).await;
        for id in 0..3 {
            publish_message(broker.as_ref(), QUEUE, &Ping { id, target: None })
                .await
                .unwrap();
        }

        consumer.run(cancel).await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(broker.depth(QUEUE).await, 1);
        assert_eq!(broker.in_flight().await, 0);
        let info = broker.declare_queue(QUEUE).await.unwrap();
        assert_eq!(info.consumer_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_recovers_deliveries_abandoned_by_a_dead_consumer() {
        let cancel = CancellationToken::new();
        let broker = Arc::new(InMemoryBroker::new().with_visibility_timeout(Duration::from_secs(30)));
        let handler = Arc::new(TestHandler {
            stop_after: Some((1, cancel.clone())),
            ..TestHandler::succeeding()
        });
        let consumer = QueueConsumer::new(broker.clone(), handler.clone(), QUEUE, ConsumerSettings::default());
        consumer.declare().await.unwrap();
        publish_message(broker.as_ref(), QUEUE, &Ping { id: 7, target: None })
            .await
            .unwrap();

        // Taken by a consumer that never settles it.
        broker.get(QUEUE).await.unwrap().unwrap();
        assert_eq!(consumer.requeue_expired().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(31)).await;

        consumer.run(cancel).await.unwrap();

        assert_eq!(handler.calls(), 1);
        assert_eq!(broker.in_flight().await, 0);
        assert_eq!(broker.depth(QUEUE).await, 0);
    }
}
