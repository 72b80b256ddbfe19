//! Status-update collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::record::DispatchRecord;
use super::{ChannelKind, NotificationStatus};
use crate::error::{DeliveryError, StoreError};

/// Identifies one channel dispatch of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchTarget {
    pub notification_id: Uuid,
    pub channel_id: Uuid,
    pub channel: ChannelKind,
}

/// Updates the status of a single channel dispatch.
///
/// Called from failure-handling paths, so callers treat its errors as
/// reportable but never let them replace the failure being handled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_channel_status(
        &self,
        target: &DispatchTarget,
        status: NotificationStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Storage for dispatch records.
#[async_trait]
pub trait NotificationRepository: StatusUpdater {
    async fn create(&self, record: DispatchRecord) -> Result<(), StoreError>;

    async fn get(&self, notification_id: Uuid) -> Result<Option<DispatchRecord>, StoreError>;
}

/// Marks `target` Failed with the error text, logging instead of returning
/// any error raised by the update itself.
pub async fn mark_failed_best_effort(
    updater: &dyn StatusUpdater,
    target: &DispatchTarget,
    cause: &DeliveryError,
) {
    if let Err(e) = updater
        .update_channel_status(target, NotificationStatus::Failed, Some(cause.to_string()))
        .await
    {
        error!(
            notification_id = %target.notification_id,
            channel_id = %target.channel_id,
            channel = %target.channel,
            error = %e,
            "Failed to mark dispatch as failed, manual intervention may be required"
        );
    }
}
