//! Bulk job processor.
//!
//! Handles one "run job" message: loads the job, claims it, fans every
//! pending item out to its channel queue and finalizes the job. Item
//! failures are recorded on the item and in the job's error log; they never
//! stop the batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{
    error_line, percent_complete, BulkItem, BulkJob, BulkJobStatus, ItemChannel, ItemStatus,
    JobCounts, StatusChange, Transition,
};
use super::store::{JobRepository, Lease};
use crate::config::model::{BulkConfig, QueuesConfig};
use crate::delivery::messages::{
    BulkJobMessage, ChannelMessage, EmailMessage, PushContent, PushMessage, SmsMessage,
};
use crate::delivery::record::DispatchRecord;
use crate::delivery::status::NotificationRepository;
use crate::delivery::ChannelKind;
use crate::error::DeliveryError;
use crate::notify::Metrics;
use crate::queue::consumer::MessageHandler;
use crate::queue::publisher::{publish_message, Publisher};

const DEFAULT_TITLE: &str = "Notification";
const DEFAULT_EMAIL_BODY: &str = "Check your notification";
const DEFAULT_TEXT: &str = "You have a new notification";
const DEFAULT_PUSH_PLATFORM: &str = "fcm";

/// Builds the channel message for one item.
///
/// `subject`, `body`, `message` and `title` variables override the defaults.
pub fn build_message(
    kind: ChannelKind,
    item: &BulkItem,
    notification_id: Uuid,
    channel_id: Uuid,
) -> ChannelMessage {
    let var = |key: &str, default: &str| {
        item.variables
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    match kind {
        ChannelKind::Email => ChannelMessage::Email(EmailMessage {
            channel_id,
            notification_id,
            to: item.recipient.clone(),
            subject: var("subject", DEFAULT_TITLE),
            body: var("body", DEFAULT_EMAIL_BODY),
            is_body_html: false,
        }),
        ChannelKind::Sms => ChannelMessage::Sms(SmsMessage {
            channel_id,
            notification_id,
            to: item.recipient.clone(),
            message: var("message", DEFAULT_TEXT),
            sender_id: None,
        }),
        ChannelKind::Push => ChannelMessage::Push(PushMessage {
            channel_id,
            notification_id,
            to: item.recipient.clone(),
            content: PushContent {
                title: var("title", DEFAULT_TITLE),
                body: var("body", DEFAULT_TEXT),
                click_action: None,
            },
            data: item.variables.clone(),
            platform: DEFAULT_PUSH_PLATFORM.to_string(),
            priority: None,
            time_to_live: None,
            condition: None,
            mutable_content: None,
            content_available: None,
        }),
    }
}

/// Consumes the bulk queue.
pub struct BulkJobProcessor {
    jobs: Arc<dyn JobRepository>,
    notifications: Arc<dyn NotificationRepository>,
    publisher: Arc<dyn Publisher>,
    queues: QueuesConfig,
    progress_interval: u64,
    lease_duration: Duration,
    worker_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl BulkJobProcessor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        notifications: Arc<dyn NotificationRepository>,
        publisher: Arc<dyn Publisher>,
        queues: QueuesConfig,
        config: &BulkConfig,
    ) -> Self {
        Self {
            jobs,
            notifications,
            publisher,
            queues,
            progress_interval: config.progress_interval.max(1),
            lease_duration: Duration::from_secs(config.lease_seconds),
            worker_id: format!("bulk-{}", Uuid::new_v4()),
            metrics: None,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Dispatches every pending item and returns the status the job ends with.
    ///
    /// The run stops early, leaving the job as it is, when the job turns
    /// terminal underneath it.
    async fn run_job(
        &self,
        job: &BulkJob,
        items: &[BulkItem],
        cancel: &CancellationToken,
    ) -> Result<BulkJobStatus, DeliveryError> {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        if let Transition::AlreadyTerminal(status) = self
            .jobs
            .transition(job.id, &StatusChange::start(started_at))
            .await?
        {
            info!(job_id = %job.id, status = %status, "Bulk job finished before the run started, skipping");
            return Ok(status);
        }

        info!(
            job_id = %job.id,
            total = job.total_count,
            "Bulk job status changed to Processing"
        );

        let mut processed = JobCounts::from_items(items).processed;
        let mut succeeded = 0u64;
        let mut failed = 0u64;

        for item in items {
            if item.status != ItemStatus::Pending {
                debug!(
                    job_id = %job.id,
                    item_id = %item.id,
                    status = %item.status,
                    "Item already processed, skipping"
                );
                continue;
            }

            if cancel.is_cancelled() {
                info!(job_id = %job.id, processed, "Shutdown requested, leaving remaining items pending");
                return Err(DeliveryError::Cancelled);
            }

            let (success, failure) = match self.dispatch_item(item).await {
                Ok(notification_id) => {
                    debug!(
                        job_id = %job.id,
                        item_id = %item.id,
                        notification_id = %notification_id,
                        "Bulk item dispatched"
                    );
                    self.record_item("sent");
                    (1, 0)
                }
                Err(e) => {
                    self.record_item_failure(job.id, item, &e).await;
                    self.record_item("failed");
                    (0, 1)
                }
            };
            succeeded += success;
            failed += failure;
            processed += 1;

            if let Some(status) = self.count_item(job.id, success, failure).await {
                info!(
                    job_id = %job.id,
                    status = %status,
                    processed,
                    "Bulk job became {} during the run, stopping",
                    status
                );
                return Ok(status);
            }

            if processed % self.progress_interval == 0 {
                self.checkpoint(job, processed).await?;
            }
        }

        self.finish(job, started_at, succeeded, failed).await
    }

    /// Adds one item to the job counters. Returns the job status when the
    /// job has become terminal.
    ///
    /// Counter writes are not retried; [`finish`](Self::finish) recomputes
    /// them from item statuses.
    async fn count_item(&self, job_id: Uuid, success: u64, failure: u64) -> Option<BulkJobStatus> {
        match self.jobs.increment_counters(job_id, 1, success, failure).await {
            Ok(status) if status.is_terminal() => Some(status),
            Ok(_) => None,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to update bulk job counters");
                None
            }
        }
    }

    /// Logs progress and renews the lease.
    async fn checkpoint(&self, job: &BulkJob, processed: u64) -> Result<(), DeliveryError> {
        info!(
            job_id = %job.id,
            processed,
            total = job.total_count,
            "Bulk job progress: {}/{} ({:.2}%)",
            processed,
            job.total_count,
            percent_complete(processed, job.total_count)
        );

        match self
            .jobs
            .try_acquire_lease(job.id, &self.worker_id, self.lease_duration)
            .await
        {
            Ok(Lease::Acquired) => Ok(()),
            Ok(Lease::HeldBy(holder)) => {
                warn!(job_id = %job.id, holder = %holder, "Bulk job lease taken over by another worker, stopping");
                Err(DeliveryError::LeaseHeld {
                    job_id: job.id,
                    holder,
                })
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to renew bulk job lease");
                Ok(())
            }
        }
    }

    /// Recomputes the counters from item statuses and marks the job Completed.
    async fn finish(
        &self,
        job: &BulkJob,
        started_at: DateTime<Utc>,
        succeeded: u64,
        failed: u64,
    ) -> Result<BulkJobStatus, DeliveryError> {
        let loaded = self
            .jobs
            .load_with_items(job.id)
            .await?
            .ok_or(DeliveryError::JobNotFound { job_id: job.id })?;
        let counts = JobCounts::from_items(&loaded.items);

        let completed_at = Utc::now();
        let change = StatusChange::complete(completed_at, counts);
        if let Transition::AlreadyTerminal(status) = self.jobs.transition(job.id, &change).await? {
            info!(job_id = %job.id, status = %status, "Bulk job finished as {} during the run, leaving it", status);
            return Ok(status);
        }

        info!(
            job_id = %job.id,
            succeeded,
            failed,
            processed = counts.processed,
            duration_secs = (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            "Bulk job completed"
        );
        Ok(BulkJobStatus::Completed)
    }

    /// Creates the dispatch record, publishes the message and marks the item Sent.
    async fn dispatch_item(&self, item: &BulkItem) -> Result<Uuid, DeliveryError> {
        let kind = match &item.channel {
            ItemChannel::Known(kind) => *kind,
            ItemChannel::Unsupported(name) => {
                return Err(DeliveryError::UnsupportedChannel(name.clone()))
            }
        };

        let notification_id = Uuid::new_v4();
        let message = build_message(kind, item, notification_id, Uuid::new_v4());

        self.notifications
            .create(DispatchRecord::for_message(message.clone()))
            .await?;

        let queue = self.queues.for_channel(kind);
        let publisher = self.publisher.as_ref();
        match &message {
            ChannelMessage::Email(m) => publish_message(publisher, queue, m).await?,
            ChannelMessage::Sms(m) => publish_message(publisher, queue, m).await?,
            ChannelMessage::Push(m) => publish_message(publisher, queue, m).await?,
        }

        self.jobs
            .update_item_status(item.id, ItemStatus::Sent, None, Some(notification_id))
            .await?;

        Ok(notification_id)
    }

    async fn record_item_failure(&self, job_id: Uuid, item: &BulkItem, error: &DeliveryError) {
        error!(
            job_id = %job_id,
            item_id = %item.id,
            error = %error,
            "Error processing bulk item"
        );

        if let Err(e) = self
            .jobs
            .update_item_status(item.id, ItemStatus::Failed, Some(error.to_string()), None)
            .await
        {
            error!(
                job_id = %job_id,
                item_id = %item.id,
                error = %e,
                "Failed to mark bulk item as failed, manual intervention may be required"
            );
        }

        let line = error_line(Utc::now(), &format!("Item {}: {}", item.recipient, error));
        if let Err(e) = self.jobs.append_error(job_id, line).await {
            error!(job_id = %job_id, error = %e, "Failed to append job error message");
        }
    }

    fn record_item(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_bulk_item(outcome);
        }
    }

    fn record_job(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_bulk_job(outcome);
        }
    }
}

#[async_trait]
impl MessageHandler for BulkJobProcessor {
    type Message = BulkJobMessage;

    fn name(&self) -> &str {
        "bulk"
    }

    async fn process(
        &self,
        message: &BulkJobMessage,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let job_id = message.job_id;
        info!(job_id = %job_id, "Starting bulk job processing");

        let Some(loaded) = self.jobs.load_with_items(job_id).await? else {
            error!(job_id = %job_id, "Bulk job not found, it may have been deleted");
            return Err(DeliveryError::JobNotFound { job_id });
        };
        let job = loaded.job;

        match job.status {
            BulkJobStatus::Cancelled => {
                info!(job_id = %job_id, "Bulk job is cancelled, skipping");
                self.record_job("skipped");
                return Ok(());
            }
            BulkJobStatus::Completed | BulkJobStatus::Failed => {
                info!(job_id = %job_id, status = %job.status, "Bulk job already finished, skipping");
                self.record_job("skipped");
                return Ok(());
            }
            _ => {}
        }

        match self
            .jobs
            .try_acquire_lease(job_id, &self.worker_id, self.lease_duration)
            .await?
        {
            Lease::Acquired => {}
            Lease::HeldBy(holder) => {
                warn!(job_id = %job_id, holder = %holder, "Bulk job is leased by another worker");
                return Err(DeliveryError::LeaseHeld { job_id, holder });
            }
        }

        let result = self.run_job(&job, &loaded.items, cancel).await;

        if let Err(e) = self.jobs.release_lease(job_id, &self.worker_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to release bulk job lease");
        }

        match &result {
            Ok(BulkJobStatus::Completed) => self.record_job("completed"),
            Ok(_) => self.record_job("stopped"),
            Err(_) => self.record_job("interrupted"),
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::bulk::control::JobControl;
    use crate::bulk::job::JobWithItems;
    use crate::bulk::store::InMemoryJobStore;
    use crate::error::{BrokerError, StoreError};
    use crate::queue::envelope::Envelope;
    use crate::delivery::store::InMemoryNotificationStore;
    use crate::queue::memory::InMemoryBroker;

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        notifications: Arc<InMemoryNotificationStore>,
        broker: Arc<InMemoryBroker>,
        processor: BulkJobProcessor,
    }

    fn fixture(progress_interval: u64) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let notifications = Arc::new(InMemoryNotificationStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let config = BulkConfig {
            progress_interval,
            lease_seconds: 60,
        };
        let processor = BulkJobProcessor::new(
            jobs.clone(),
            notifications.clone(),
            broker.clone(),
            QueuesConfig::default(),
            &config,
        )
        .with_worker_id("worker-test");

        Fixture {
            jobs,
            notifications,
            broker,
            processor,
        }
    }

    impl BulkJobProcessor {
        fn with_jobs(mut self, jobs: Arc<dyn JobRepository>) -> Self {
            self.jobs = jobs;
            self
        }
    }

    /// Delegates to an in-memory store, with knobs for failing counter
    /// writes and handing the lease to another worker.
    struct ObservedJobs {
        inner: Arc<InMemoryJobStore>,
        fail_next_increment: AtomicBool,
        /// Lease calls allowed before `worker-thief` takes the lease; 0 never.
        steal_lease_after: AtomicUsize,
        lease_calls: AtomicUsize,
    }

    impl ObservedJobs {
        fn new(inner: Arc<InMemoryJobStore>) -> Self {
            Self {
                inner,
                fail_next_increment: AtomicBool::new(false),
                steal_lease_after: AtomicUsize::new(0),
                lease_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobRepository for ObservedJobs {
        async fn create_job(&self, job: &BulkJob, items: &[BulkItem]) -> Result<(), StoreError> {
            self.inner.create_job(job, items).await
        }

        async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, StoreError> {
            self.inner.get_job(job_id).await
        }

        async fn load_with_items(&self, job_id: Uuid) -> Result<Option<JobWithItems>, StoreError> {
            self.inner.load_with_items(job_id).await
        }

        async fn transition(
            &self,
            job_id: Uuid,
            change: &StatusChange,
        ) -> Result<Transition, StoreError> {
            self.inner.transition(job_id, change).await
        }

        async fn update_item_status(
            &self,
            item_id: Uuid,
            status: ItemStatus,
            error_message: Option<String>,
            notification_id: Option<Uuid>,
        ) -> Result<(), StoreError> {
            self.inner
                .update_item_status(item_id, status, error_message, notification_id)
                .await
        }

        async fn increment_counters(
            &self,
            job_id: Uuid,
            processed: u64,
            success: u64,
            failed: u64,
        ) -> Result<BulkJobStatus, StoreError> {
            if self.fail_next_increment.swap(false, Ordering::SeqCst) {
                return Err(StoreError::WriteFailed("connection reset".into()));
            }
            self.inner
                .increment_counters(job_id, processed, success, failed)
                .await
        }

        async fn append_error(&self, job_id: Uuid, line: String) -> Result<(), StoreError> {
            self.inner.append_error(job_id, line).await
        }

        async fn try_acquire_lease(
            &self,
            job_id: Uuid,
            holder: &str,
            ttl: Duration,
        ) -> Result<Lease, StoreError> {
            let calls = self.lease_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let steal_after = self.steal_lease_after.load(Ordering::SeqCst);
            if steal_after > 0 && calls > steal_after {
                self.inner.release_lease(job_id, holder).await?;
                self.inner.try_acquire_lease(job_id, "worker-thief", ttl).await?;
            }
            self.inner.try_acquire_lease(job_id, holder, ttl).await
        }

        async fn release_lease(&self, job_id: Uuid, holder: &str) -> Result<bool, StoreError> {
            self.inner.release_lease(job_id, holder).await
        }
    }

    /// Cancels the job through the operator path as soon as the first item
    /// is published.
    struct CancellingPublisher {
        inner: Arc<InMemoryBroker>,
        control: JobControl,
        job_id: Uuid,
    }

    #[async_trait]
    impl Publisher for CancellingPublisher {
        async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError> {
            self.inner.publish(queue, envelope).await?;
            self.control.cancel(self.job_id).await.ok();
            Ok(())
        }
    }

    async fn seed(jobs: &InMemoryJobStore, items: Vec<BulkItem>, job: &BulkJob) {
        jobs.create_job(job, &items).await.unwrap();
    }

    async fn load(jobs: &InMemoryJobStore, job_id: Uuid) -> JobWithItems {
        jobs.load_with_items(job_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn unsupported_channel_fails_only_its_item() {
        let f = fixture(100);
        let job = BulkJob::new("launch", 3);
        let items = vec![
            BulkItem::new(job.id, "a@example.com", ChannelKind::Email),
            BulkItem::new(job.id, "b@example.com", ChannelKind::Email),
            BulkItem::new(job.id, "fax-0001", ItemChannel::Unsupported("fax".into())),
        ];
        seed(&f.jobs, items, &job).await;

        f.processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Completed);
        assert_eq!(loaded.job.processed_count, 3);
        assert_eq!(loaded.job.success_count, 2);
        assert_eq!(loaded.job.failed_count, 1);
        assert!(loaded.job.completed_at.is_some());
        assert_eq!(loaded.job.error_messages.len(), 1);
        assert!(loaded.job.error_messages[0].ends_with("Item fax-0001: Unsupported channel type: fax"));

        let failed = &loaded.items[2];
        assert_eq!(failed.status, ItemStatus::Failed);
        assert!(failed.error_message.is_some());

        assert_eq!(f.broker.depth("email-notifications").await, 2);
        assert_eq!(f.notifications.len().await, 2);
    }

    #[tokio::test]
    async fn published_payload_matches_dispatch_record() {
        let f = fixture(100);
        let job = BulkJob::new("sms", 1);
        let item = BulkItem::new(job.id, "+15550100", ChannelKind::Sms)
            .with_variable("message", "Your code is 1234");
        let item_id = item.id;
        seed(&f.jobs, vec![item], &job).await;

        f.processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let published = f.broker.snapshot("sms-notifications").await;
        assert_eq!(published.len(), 1);
        let sms: SmsMessage = published[0].decode().unwrap();
        assert_eq!(sms.message, "Your code is 1234");

        let item = f.jobs.item(item_id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Sent);
        assert_eq!(item.notification_id, Some(sms.notification_id));
        assert!(item.sent_at.is_some());
        assert!(f.notifications.get(sms.notification_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn redelivery_skips_processed_items_and_recounts() {
        let f = fixture(100);
        let mut job = BulkJob::new("digest", 2);
        job.status = BulkJobStatus::Processing;
        let mut sent = BulkItem::new(job.id, "a@example.com", ChannelKind::Email);
        sent.status = ItemStatus::Sent;
        let items = vec![sent, BulkItem::new(job.id, "device-token", ChannelKind::Push)];
        // The earlier run died before its counter write landed.
        seed(&f.jobs, items, &job).await;

        f.processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Completed);
        assert_eq!(loaded.job.processed_count, 2);
        assert_eq!(loaded.job.success_count, 2);
        assert_eq!(f.broker.depth("email-notifications").await, 0);
        assert_eq!(f.broker.depth("push-notifications").await, 1);
    }

    #[tokio::test]
    async fn failed_counter_write_does_not_abort_the_run() {
        let f = fixture(100);
        let jobs = Arc::new(ObservedJobs::new(f.jobs.clone()));
        jobs.fail_next_increment.store(true, Ordering::SeqCst);
        let processor = f.processor.with_jobs(jobs);
        let job = BulkJob::new("flaky", 2);
        seed(
            &f.jobs,
            vec![
                BulkItem::new(job.id, "a@example.com", ChannelKind::Email),
                BulkItem::new(job.id, "b@example.com", ChannelKind::Email),
            ],
            &job,
        )
        .await;

        processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Completed);
        assert_eq!(
            (loaded.job.processed_count, loaded.job.success_count, loaded.job.failed_count),
            (2, 2, 0)
        );
        assert_eq!(f.broker.depth("email-notifications").await, 2);
    }

    #[tokio::test]
    async fn cancel_during_run_stops_and_keeps_cancelled() {
        let f = fixture(100);
        let job = BulkJob::new("recalled", 3);
        let items: Vec<_> = (0..3)
            .map(|i| BulkItem::new(job.id, format!("user{}@example.com", i), ChannelKind::Email))
            .collect();
        seed(&f.jobs, items, &job).await;

        let publisher = Arc::new(CancellingPublisher {
            inner: f.broker.clone(),
            control: JobControl::new(f.jobs.clone(), f.broker.clone(), "bulk-notifications"),
            job_id: job.id,
        });
        let processor = BulkJobProcessor::new(
            f.jobs.clone(),
            f.notifications.clone(),
            publisher,
            QueuesConfig::default(),
            &BulkConfig::default(),
        );

        processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Cancelled);
        assert!(loaded.job.completed_at.is_none());
        assert_eq!(loaded.items[0].status, ItemStatus::Sent);
        assert_eq!(loaded.items[1].status, ItemStatus::Pending);
        assert_eq!(loaded.items[2].status, ItemStatus::Pending);
        assert_eq!(f.broker.depth("email-notifications").await, 1);
    }

    #[tokio::test]
    async fn lease_is_renewed_every_progress_interval() {
        let f = fixture(2);
        let jobs = Arc::new(ObservedJobs::new(f.jobs.clone()));
        let processor = f.processor.with_jobs(jobs.clone());
        let job = BulkJob::new("checkpoints", 5);
        let items: Vec<_> = (0..5)
            .map(|i| BulkItem::new(job.id, format!("user{}@example.com", i), ChannelKind::Email))
            .collect();
        seed(&f.jobs, items, &job).await;

        processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        // One claim, then renewals after items 2 and 4.
        assert_eq!(jobs.lease_calls.load(Ordering::SeqCst), 3);
        assert_eq!(load(&f.jobs, job.id).await.job.status, BulkJobStatus::Completed);
    }

    #[tokio::test]
    async fn lost_lease_stops_the_run_at_the_next_checkpoint() {
        let f = fixture(1);
        let jobs = Arc::new(ObservedJobs::new(f.jobs.clone()));
        jobs.steal_lease_after.store(1, Ordering::SeqCst);
        let processor = f.processor.with_jobs(jobs);
        let job = BulkJob::new("contested", 3);
        let items: Vec<_> = (0..3)
            .map(|i| BulkItem::new(job.id, format!("user{}@example.com", i), ChannelKind::Email))
            .collect();
        seed(&f.jobs, items, &job).await;

        let result = processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::LeaseHeld { holder, .. }) if holder == "worker-thief"));
        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Processing);
        assert_eq!(loaded.items[0].status, ItemStatus::Sent);
        assert_eq!(loaded.items[1].status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn cancelled_job_is_left_untouched() {
        let f = fixture(100);
        let mut job = BulkJob::new("cancelled", 1);
        job.status = BulkJobStatus::Cancelled;
        seed(
            &f.jobs,
            vec![BulkItem::new(job.id, "a@example.com", ChannelKind::Email)],
            &job,
        )
        .await;

        f.processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job, job);
        assert_eq!(loaded.items[0].status, ItemStatus::Pending);
        assert_eq!(f.broker.depth("email-notifications").await, 0);
    }

    #[tokio::test]
    async fn missing_job_is_an_error() {
        let f = fixture(100);
        let job_id = Uuid::new_v4();

        let result = f
            .processor
            .process(&BulkJobMessage { job_id }, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DeliveryError::JobNotFound { job_id: id }) if id == job_id));
    }

    #[tokio::test]
    async fn leased_job_is_retried_later() {
        let f = fixture(100);
        let job = BulkJob::new("contended", 1);
        seed(
            &f.jobs,
            vec![BulkItem::new(job.id, "a@example.com", ChannelKind::Email)],
            &job,
        )
        .await;
        f.jobs
            .try_acquire_lease(job.id, "worker-other", Duration::from_secs(60))
            .await
            .unwrap();

        let result = f
            .processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await;

        let error = result.unwrap_err();
        assert!(matches!(&error, DeliveryError::LeaseHeld { holder, .. } if holder == "worker-other"));
        assert!(error.kind().is_transient());
        assert_eq!(load(&f.jobs, job.id).await.job.status, BulkJobStatus::Pending);
    }

    #[tokio::test]
    async fn lease_is_released_after_the_run() {
        let f = fixture(1);
        let job = BulkJob::new("release", 1);
        seed(
            &f.jobs,
            vec![BulkItem::new(job.id, "a@example.com", ChannelKind::Email)],
            &job,
        )
        .await;

        f.processor
            .process(&BulkJobMessage { job_id: job.id }, &CancellationToken::new())
            .await
            .unwrap();

        let lease = f
            .jobs
            .try_acquire_lease(job.id, "worker-next", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(lease, Lease::Acquired);
    }

    #[tokio::test]
    async fn cancellation_leaves_remaining_items_pending() {
        let f = fixture(100);
        let job = BulkJob::new("shutdown", 1);
        seed(
            &f.jobs,
            vec![BulkItem::new(job.id, "a@example.com", ChannelKind::Email)],
            &job,
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f
            .processor
            .process(&BulkJobMessage { job_id: job.id }, &cancel)
            .await;

        assert!(matches!(result, Err(DeliveryError::Cancelled)));
        let loaded = load(&f.jobs, job.id).await;
        assert_eq!(loaded.job.status, BulkJobStatus::Processing);
        assert_eq!(loaded.items[0].status, ItemStatus::Pending);
    }

    #[test]
    fn push_messages_carry_item_variables() {
        let item = BulkItem::new(Uuid::new_v4(), "device-token", ChannelKind::Push)
            .with_variable("orderId", "42");

        let ChannelMessage::Push(push) =
            build_message(ChannelKind::Push, &item, Uuid::new_v4(), Uuid::new_v4())
        else {
            panic!("expected a push message");
        };

        assert_eq!(push.platform, "fcm");
        assert_eq!(push.content.title, "Notification");
        assert_eq!(push.data.get("orderId").map(String::as_str), Some("42"));
    }
}
