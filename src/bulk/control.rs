//! Operator controls for bulk jobs: progress, cancellation and run requests.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::job::{JobProgress, StatusChange, Transition};
use super::store::JobRepository;
use crate::delivery::messages::BulkJobMessage;
use crate::error::{BrokerError, StoreError};
use crate::queue::publisher::{publish_message, Publisher};

pub struct JobControl {
    jobs: Arc<dyn JobRepository>,
    publisher: Arc<dyn Publisher>,
    bulk_queue: String,
}

impl JobControl {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        publisher: Arc<dyn Publisher>,
        bulk_queue: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            publisher,
            bulk_queue: bulk_queue.into(),
        }
    }

    pub async fn progress(&self, job_id: Uuid) -> Result<JobProgress, StoreError> {
        self.jobs
            .get_job(job_id)
            .await?
            .map(|job| job.progress())
            .ok_or(StoreError::JobNotFound { job_id })
    }

    /// Moves a non-terminal job to Cancelled.
    ///
    /// A run in progress notices the change after its current item and
    /// stops without finalizing the job.
    pub async fn cancel(&self, job_id: Uuid) -> Result<(), StoreError> {
        match self.jobs.transition(job_id, &StatusChange::cancel()).await? {
            Transition::Applied => {
                info!(job_id = %job_id, "Bulk job cancelled");
                Ok(())
            }
            Transition::AlreadyTerminal(status) => Err(StoreError::TerminalJob {
                job_id,
                status: status.to_string(),
            }),
        }
    }

    /// Queues a run of `job_id` on the bulk queue.
    pub async fn publish_run(&self, job_id: Uuid) -> Result<(), BrokerError> {
        publish_message(
            self.publisher.as_ref(),
            &self.bulk_queue,
            &BulkJobMessage { job_id },
        )
        .await?;
        info!(job_id = %job_id, queue = %self.bulk_queue, "Bulk job queued");
        Ok(())
    }
}
