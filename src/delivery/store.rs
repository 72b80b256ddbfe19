//! Dispatch-record stores.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::record::DispatchRecord;
use super::status::{DispatchTarget, NotificationRepository, StatusUpdater};
use super::NotificationStatus;
use crate::error::StoreError;

const NOTIFICATION_PREFIX: &str = "notification:";

/// Process-local store, used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<Uuid, DispatchRecord>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StatusUpdater for InMemoryNotificationStore {
    async fn update_channel_status(
        &self,
        target: &DispatchTarget,
        status: NotificationStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record =
            records
                .get_mut(&target.notification_id)
                .ok_or(StoreError::DispatchNotFound {
                    notification_id: target.notification_id,
                    channel_id: target.channel_id,
                })?;
        record.apply_status(target, status, error_message)
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationStore {
    async fn create(&self, record: DispatchRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.notification_id, record);
        Ok(())
    }

    async fn get(&self, notification_id: Uuid) -> Result<Option<DispatchRecord>, StoreError> {
        Ok(self.records.read().await.get(&notification_id).cloned())
    }
}

/// Redis store keeping each record as a JSON string under `notification:{id}`.
#[derive(Clone)]
pub struct RedisNotificationStore {
    connection: ConnectionManager,
}

impl RedisNotificationStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    fn key(notification_id: Uuid) -> String {
        format!("{}{}", NOTIFICATION_PREFIX, notification_id)
    }

    async fn save(&self, record: &DispatchRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;

        self.connection
            .clone()
            .set::<_, _, ()>(Self::key(record.notification_id), json)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))
    }
}

#[async_trait]
impl StatusUpdater for RedisNotificationStore {
    async fn update_channel_status(
        &self,
        target: &DispatchTarget,
        status: NotificationStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .get(target.notification_id)
            .await?
            .ok_or(StoreError::DispatchNotFound {
                notification_id: target.notification_id,
                channel_id: target.channel_id,
            })?;

        record.apply_status(target, status, error_message)?;
        self.save(&record).await?;

        debug!(
            notification_id = %target.notification_id,
            channel_id = %target.channel_id,
            status = %status,
            "Updated channel status"
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for RedisNotificationStore {
    async fn create(&self, record: DispatchRecord) -> Result<(), StoreError> {
        self.save(&record).await
    }

    async fn get(&self, notification_id: Uuid) -> Result<Option<DispatchRecord>, StoreError> {
        let json: Option<String> = self
            .connection
            .clone()
            .get(Self::key(notification_id))
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::SerializationFailed(e.to_string()))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::messages::{ChannelMessage, SmsMessage};

    #[tokio::test]
    async fn updates_existing_dispatch() {
        let store = InMemoryNotificationStore::new();
        let message = ChannelMessage::Sms(SmsMessage {
            channel_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            to: "+15550100".into(),
            message: "hello".into(),
            sender_id: None,
        });
        let target = message.target();
        store
            .create(DispatchRecord::for_message(message))
            .await
            .unwrap();

        store
            .update_channel_status(&target, NotificationStatus::Failed, Some("bounced".into()))
            .await
            .unwrap();

        let record = store.get(target.notification_id).await.unwrap().unwrap();
        let state = record.dispatch(target.channel_id).unwrap().state();
        assert_eq!(state.status, NotificationStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("bounced"));
    }

    #[tokio::test]
    async fn missing_record_is_an_error() {
        let store = InMemoryNotificationStore::new();
        let target = DispatchTarget {
            notification_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            channel: crate::delivery::ChannelKind::Email,
        };

        let result = store
            .update_channel_status(&target, NotificationStatus::Failed, None)
            .await;
        assert!(matches!(result, Err(StoreError::DispatchNotFound { .. })));
    }
}
