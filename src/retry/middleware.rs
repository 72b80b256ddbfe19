//! In-process retry wrapper.
//!
//! Retries a handler a bounded number of times with backoff without going back
//! through the broker. The backoff sleeps on the caller's task, so a consumer
//! using this stalls its queue for the duration of the wait.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::policy::RetryPolicy;
use crate::delivery::status::{mark_failed_best_effort, DispatchTarget, StatusUpdater};
use crate::error::DeliveryError;

/// Outcome of [`ProcessingMiddleware::process_with_error_handling`].
#[derive(Debug)]
pub enum ProcessingResult {
    Success,
    Failure(DeliveryError),
}

impl ProcessingResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The error that caused the final failure, if any.
    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Success => None,
            Self::Failure(e) => Some(e),
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Clone)]
pub struct ProcessingMiddleware {
    policy: Arc<dyn RetryPolicy>,
}

impl ProcessingMiddleware {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    /// Calls `operation` until it succeeds or the policy stops retrying.
    ///
    /// `operation` receives the zero-based attempt number. A cancelled token
    /// interrupts the backoff wait and returns the last failure.
    pub async fn execute<F, Fut>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        let mut attempt = 0u32;

        loop {
            debug!(attempt = attempt + 1, "Processing message");

            let error = match operation(attempt).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Message processed after retry");
                    }
                    return Ok(());
                }
                Err(e) => e,
            };

            warn!(
                attempt = attempt + 1,
                kind = %error.kind(),
                error = %error,
                "Error processing message"
            );

            if !self.policy.should_retry(attempt, error.kind()) {
                return Err(error);
            }

            let delay = self.policy.retry_delay(attempt);
            info!(delay_ms = delay.as_millis() as u64, "Retrying after backoff");

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Backoff interrupted by shutdown");
                    return Err(error);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Like [`execute`](Self::execute), but marks the dispatch Failed once
    /// every attempt is exhausted.
    ///
    /// The status update is best-effort: its own errors are logged and never
    /// replace the failure being reported.
    pub async fn process_with_error_handling<F, Fut>(
        &self,
        operation: F,
        target: Option<&DispatchTarget>,
        updater: &dyn StatusUpdater,
        cancel: &CancellationToken,
    ) -> ProcessingResult
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), DeliveryError>>,
    {
        match self.execute(operation, cancel).await {
            Ok(()) => ProcessingResult::Success,
            Err(e) => {
                error!(error = %e, "Message processing failed after all retry attempts");
                if let Some(target) = target {
                    mark_failed_best_effort(updater, target, &e).await;
                }
                ProcessingResult::Failure(e)
            }
        }
    }
}
