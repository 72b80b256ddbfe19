//! Dead-letter queue administration and monitoring.
//!
//! Every operation here races with live producers and consumers on the same
//! queues. Results are snapshots, not transactional views.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{dead_letter_queue_name, Broker, QueueInfo};
use super::envelope::HeaderValue;
use crate::error::BrokerError;
use crate::notify::{DeadLetterAlerter, Metrics};

/// A dead-lettered message as seen by [`DeadLetterService::peek`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeekedMessage {
    pub delivery_tag: u64,
    pub body: String,
    pub headers: BTreeMap<String, HeaderValue>,
    pub retry_count: u32,
    pub redelivered: bool,
}

pub struct DeadLetterService<B: ?Sized> {
    broker: Arc<B>,
    dead_letter_queues: Vec<String>,
}

impl<B: Broker + ?Sized> DeadLetterService<B> {
    pub fn new(broker: Arc<B>, dead_letter_queues: Vec<String>) -> Self {
        Self {
            broker,
            dead_letter_queues,
        }
    }

    /// Builds the service for the dead-letter queues of `main_queues`.
    pub fn for_main_queues<S: AsRef<str>>(broker: Arc<B>, main_queues: &[S]) -> Self {
        let queues = main_queues
            .iter()
            .map(|q| dead_letter_queue_name(q.as_ref()))
            .collect();
        Self::new(broker, queues)
    }

    pub fn dead_letter_queues(&self) -> &[String] {
        &self.dead_letter_queues
    }

    /// Message and consumer counts for every known dead-letter queue.
    ///
    /// Queues that cannot be inspected are logged and left out.
    pub async fn stats(&self) -> Vec<QueueInfo> {
        let mut stats = Vec::with_capacity(self.dead_letter_queues.len());
        for queue in &self.dead_letter_queues {
            match self.broker.declare_queue(queue).await {
                Ok(info) => stats.push(info),
                Err(e) => error!(queue = %queue, error = %e, "Failed to read dead-letter queue stats"),
            }
        }
        stats
    }

    /// Lists up to `limit` messages and returns them to the queue.
    ///
    /// Order is preserved when nothing else touches the queue meanwhile.
    pub async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<PeekedMessage>, BrokerError> {
        self.recover_abandoned(queue).await;
        let available = self.broker.declare_queue(queue).await?.message_count;
        let wanted = usize::try_from(available).map_or(limit, |n| n.min(limit));

        let mut messages = Vec::with_capacity(wanted);
        let mut fetch_error = None;
        for _ in 0..wanted {
            match self.broker.get(queue).await {
                Ok(Some(delivery)) => messages.push(PeekedMessage {
                    delivery_tag: delivery.delivery_tag,
                    retry_count: delivery.envelope.retry_count(),
                    body: delivery.envelope.body,
                    headers: delivery.envelope.headers,
                    redelivered: delivery.redelivered,
                }),
                Ok(None) => break,
                Err(e) => {
                    fetch_error = Some(e);
                    break;
                }
            }
        }

        // Requeue puts each message at the head, so return them newest first.
        let mut requeue_error = None;
        for message in messages.iter().rev() {
            if let Err(e) = self.broker.nack(queue, message.delivery_tag, true).await {
                error!(
                    queue = %queue,
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Failed to return peeked message"
                );
                requeue_error.get_or_insert(e);
            }
        }

        if let Some(e) = fetch_error.or(requeue_error) {
            return Err(e);
        }

        debug!(queue = %queue, count = messages.len(), "Peeked dead-letter queue");
        Ok(messages)
    }

    /// Moves the head of `dead_letter_queue` back onto `original_queue`
    /// with a fresh retry budget.
    ///
    /// `delivery_tag` is the tag the operator saw when peeking. Tags change
    /// on every delivery, so it is only logged. Returns false when the queue
    /// is empty.
    pub async fn reprocess_one(
        &self,
        dead_letter_queue: &str,
        original_queue: &str,
        delivery_tag: u64,
    ) -> Result<bool, BrokerError> {
        debug!(
            dead_letter_queue = %dead_letter_queue,
            requested_tag = delivery_tag,
            "Reprocessing dead-letter queue head"
        );
        self.recover_abandoned(dead_letter_queue).await;
        self.reprocess_next(dead_letter_queue, original_queue).await
    }

    /// Reprocesses as many messages as the queue held when the call started.
    pub async fn reprocess_all(
        &self,
        dead_letter_queue: &str,
        original_queue: &str,
    ) -> Result<u64, BrokerError> {
        self.recover_abandoned(dead_letter_queue).await;
        let snapshot = self
            .broker
            .declare_queue(dead_letter_queue)
            .await?
            .message_count;

        let mut reprocessed = 0;
        while reprocessed < snapshot {
            if !self.reprocess_next(dead_letter_queue, original_queue).await? {
                break;
            }
            reprocessed += 1;
        }

        info!(
            dead_letter_queue = %dead_letter_queue,
            original_queue = %original_queue,
            reprocessed,
            "Reprocessed dead-letter queue"
        );
        Ok(reprocessed)
    }

    /// Deletes every message in `queue`. Irreversible.
    pub async fn purge(&self, queue: &str) -> Result<u64, BrokerError> {
        let removed = self.broker.purge(queue).await?;
        warn!(queue = %queue, removed, "Purged queue");
        Ok(removed)
    }

    /// Returns messages stranded in flight by an interrupted peek or
    /// reprocess.
    async fn recover_abandoned(&self, queue: &str) {
        match self.broker.requeue_expired(queue).await {
            Ok(0) => {}
            Ok(requeued) => info!(queue = %queue, requeued, "Recovered abandoned dead-letter deliveries"),
            Err(e) => warn!(queue = %queue, error = %e, "Failed to recover abandoned dead-letter deliveries"),
        }
    }

    async fn reprocess_next(
        &self,
        dead_letter_queue: &str,
        original_queue: &str,
    ) -> Result<bool, BrokerError> {
        let Some(delivery) = self.broker.get(dead_letter_queue).await? else {
            return Ok(false);
        };

        let envelope = delivery.envelope.reset_for_reprocess(Utc::now());
        if let Err(e) = self.broker.publish(original_queue, envelope).await {
            self.broker
                .nack(dead_letter_queue, delivery.delivery_tag, true)
                .await?;
            return Err(e);
        }
        self.broker
            .ack(dead_letter_queue, delivery.delivery_tag)
            .await?;

        info!(
            dead_letter_queue = %dead_letter_queue,
            original_queue = %original_queue,
            delivery_tag = delivery.delivery_tag,
            "Message reprocessed from dead-letter queue"
        );
        Ok(true)
    }
}

/// Periodically reports dead-letter queue depth.
pub struct DeadLetterMonitor<B: ?Sized> {
    service: Arc<DeadLetterService<B>>,
    interval: Duration,
    alert_threshold: u64,
    alerter: Option<DeadLetterAlerter>,
    metrics: Option<Arc<Metrics>>,
}

impl<B: Broker + ?Sized> DeadLetterMonitor<B> {
    pub fn new(service: Arc<DeadLetterService<B>>, interval: Duration, alert_threshold: u64) -> Self {
        Self {
            service,
            interval,
            alert_threshold,
            alerter: None,
            metrics: None,
        }
    }

    pub fn with_alerter(mut self, alerter: DeadLetterAlerter) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One monitoring pass. Returns the queues at or above the threshold.
    pub async fn check(&self) -> Vec<QueueInfo> {
        let stats = self.service.stats().await;
        let mut alerting = Vec::new();

        for info in stats {
            if let Some(metrics) = &self.metrics {
                metrics.set_dead_letter_depth(&info.queue, info.message_count);
            }
            if info.message_count == 0 {
                continue;
            }

            if self.alert_threshold > 0 && info.message_count >= self.alert_threshold {
                warn!(
                    queue = %info.queue,
                    messages = info.message_count,
                    threshold = self.alert_threshold,
                    "Dead-letter queue above alert threshold"
                );
                alerting.push(info);
            } else {
                info!(queue = %info.queue, messages = info.message_count, "Dead-letter queue has messages");
            }
        }

        if !alerting.is_empty() {
            if let Some(alerter) = &self.alerter {
                if let Err(e) = alerter.alert(&alerting, self.alert_threshold).await {
                    error!(error = %e, "Failed to send dead-letter alert");
                }
            }
        }

        alerting
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            queues = self.service.dead_letter_queues().len(),
            "Dead-letter monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.check().await;
        }

        info!("Dead-letter monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::broker::QueueTopology;
    use crate::queue::envelope::{Envelope, REPROCESSED_AT_HEADER, RETRY_COUNT_HEADER};
    use crate::queue::memory::InMemoryBroker;
    use crate::queue::publisher::Publisher;

    const MAIN: &str = "push-notifications";
    const DLQ: &str = "push-notifications-dlq";

    async fn seeded(bodies: &[&str]) -> (Arc<InMemoryBroker>, DeadLetterService<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_with_dead_letter(&QueueTopology::for_queue(MAIN))
            .await
            .unwrap();
        for body in bodies {
            let envelope =
                Envelope::new(*body).with_header(RETRY_COUNT_HEADER, HeaderValue::Int(2));
            broker.publish(DLQ, envelope).await.unwrap();
        }
        let service = DeadLetterService::for_main_queues(broker.clone(), &[MAIN]);
        (broker, service)
    }

    #[tokio::test(start_paused = true)]
    async fn peek_recovers_messages_stranded_by_an_interrupted_peek() {
        let broker = Arc::new(InMemoryBroker::new().with_visibility_timeout(Duration::from_secs(60)));
        broker
            .declare_with_dead_letter(&QueueTopology::for_queue(MAIN))
            .await
            .unwrap();
        broker.publish(DLQ, Envelope::new("stranded")).await.unwrap();
        let service = DeadLetterService::for_main_queues(broker.clone(), &[MAIN]);

        // An earlier peek took the message and died before returning it.
        broker.get(DLQ).await.unwrap().unwrap();
        assert!(service.peek(DLQ, 10).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let peeked = service.peek(DLQ, 10).await.unwrap();

        assert_eq!(peeked.len(), 1);
        assert_eq!(peeked[0].body, "stranded");
        assert!(peeked[0].redelivered);
        assert_eq!(broker.depth(DLQ).await, 1);
        assert_eq!(broker.in_flight().await, 0);
    }

    #[tokio::test]
    async fn stats_report_each_dead_letter_queue() {
        let (_broker, service) = seeded(&["a", "b"]).await;

        let stats = service.stats().await;

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].queue, DLQ);
        assert_eq!(stats[0].message_count, 2);
    }

    #[tokio::test]
    async fn peek_is_non_destructive_and_keeps_order() {
        let (broker, service) = seeded(&["a", "b", "c"]).await;

        let peeked = service.peek(DLQ, 2).await.unwrap();

        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].body, "a");
        assert_eq!(peeked[1].body, "b");
        assert_eq!(peeked[0].retry_count, 2);
        let remaining: Vec<_> = broker
            .snapshot(DLQ)
            .await
            .into_iter()
            .map(|e| e.body)
            .collect();
        assert_eq!(remaining, ["a", "b", "c"]);
        assert_eq!(broker.in_flight().await, 0);
    }

    #[tokio::test]
    async fn peek_limit_larger_than_queue() {
        let (_broker, service) = seeded(&["only"]).await;
        assert_eq!(service.peek(DLQ, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reprocess_one_resets_count_and_stamps_provenance() {
        let (broker, service) = seeded(&["a", "b"]).await;

        assert!(service.reprocess_one(DLQ, MAIN, 1).await.unwrap());

        assert_eq!(broker.depth(DLQ).await, 1);
        let main = broker.snapshot(MAIN).await;
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].body, "a");
        assert_eq!(main[0].retry_count(), 0);
        assert!(main[0].is_reprocessed());
        assert!(main[0].header(REPROCESSED_AT_HEADER).is_some());
    }

    #[tokio::test]
    async fn reprocess_one_on_empty_queue() {
        let (_broker, service) = seeded(&[]).await;
        assert!(!service.reprocess_one(DLQ, MAIN, 42).await.unwrap());
    }

    #[tokio::test]
    async fn reprocess_all_drains_snapshot() {
        let (broker, service) = seeded(&["a", "b", "c"]).await;

        assert_eq!(service.reprocess_all(DLQ, MAIN).await.unwrap(), 3);
        assert_eq!(broker.depth(DLQ).await, 0);
        assert_eq!(broker.depth(MAIN).await, 3);
    }

    #[tokio::test]
    async fn purge_empties_queue() {
        let (broker, service) = seeded(&["a", "b"]).await;

        assert_eq!(service.purge(DLQ).await.unwrap(), 2);
        assert_eq!(broker.depth(DLQ).await, 0);
    }

    #[tokio::test]
    async fn monitor_flags_queues_at_threshold() {
        let (_broker, service) = seeded(&["a", "b", "c"]).await;
        let monitor = DeadLetterMonitor::new(Arc::new(service), Duration::from_secs(60), 3);

        let alerting = monitor.check().await;
        assert_eq!(alerting.len(), 1);
        assert_eq!(alerting[0].message_count, 3);

        let quiet = DeadLetterMonitor::new(monitor.service.clone(), Duration::from_secs(60), 10);
        assert!(quiet.check().await.is_empty());
    }
}
