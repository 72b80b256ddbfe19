//! Job and item storage.
//!
//! Redis keys:
//! - `bulk:job:{id}`: job fields (hash; counters updated with `HINCRBY`)
//! - `bulk:job:{id}:items`: item ids in creation order (list)
//! - `bulk:job:{id}:errors`: timestamped error lines (list)
//! - `bulk:job:{id}:lease`: worker holding the job (string with expiry)
//! - `bulk:item:{id}`: item record (JSON string)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::job::{
    BulkItem, BulkJob, BulkJobStatus, ItemStatus, JobWithItems, StatusChange, Transition,
};
use crate::error::StoreError;

const JOB_PREFIX: &str = "bulk:job:";
const ITEM_PREFIX: &str = "bulk:item:";

/// Applies a status change unless the job is terminal.
/// Returns {0, ''} for a missing job, {1, new} when applied and
/// {2, current} when the job had already finished.
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
  return {0, ''}
end
if current == 'completed' or current == 'failed' or current == 'cancelled' then
  return {2, current}
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
if ARGV[2] ~= '' then
  redis.call('HSET', KEYS[1], 'started_at', ARGV[2])
end
if ARGV[3] ~= '' then
  redis.call('HSET', KEYS[1], 'completed_at', ARGV[3])
end
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[1], 'processed_count', ARGV[4], 'success_count', ARGV[5], 'failed_count', ARGV[6])
end
return {1, ARGV[1]}
";

/// Returns the job status after incrementing, '' for a missing job.
const INCREMENT_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return ''
end
redis.call('HINCRBY', KEYS[1], 'processed_count', ARGV[1])
redis.call('HINCRBY', KEYS[1], 'success_count', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'failed_count', ARGV[3])
return status
";

const APPEND_ERROR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
";

/// Takes or renews the lease. Returns '' when held by the caller afterwards,
/// otherwise the current holder.
const ACQUIRE_LEASE_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if (not holder) or holder == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return ''
end
return holder
";

const RELEASE_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Result of trying to claim a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lease {
    Acquired,
    HeldBy(String),
}

/// Persistence for bulk jobs and their items.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Stores a job and its items, replacing any previous record with the same id.
    async fn create_job(&self, job: &BulkJob, items: &[BulkItem]) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, StoreError>;

    async fn load_with_items(&self, job_id: Uuid) -> Result<Option<JobWithItems>, StoreError>;

    /// Applies `change` atomically unless the job is already Completed,
    /// Failed or Cancelled.
    async fn transition(
        &self,
        job_id: Uuid,
        change: &StatusChange,
    ) -> Result<Transition, StoreError>;

    async fn update_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error_message: Option<String>,
        notification_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    /// Adds to the job counters atomically and returns the job's status.
    async fn increment_counters(
        &self,
        job_id: Uuid,
        processed: u64,
        success: u64,
        failed: u64,
    ) -> Result<BulkJobStatus, StoreError>;

    async fn append_error(&self, job_id: Uuid, line: String) -> Result<(), StoreError>;

    /// Claims `job_id` for `holder` for `ttl`. Re-acquiring an own lease renews it.
    async fn try_acquire_lease(
        &self,
        job_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Drops the lease if `holder` still owns it. Returns whether it did.
    async fn release_lease(&self, job_id: Uuid, holder: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, BulkJob>,
    job_items: HashMap<Uuid, Vec<Uuid>>,
    items: HashMap<Uuid, BulkItem>,
    leases: HashMap<Uuid, (String, Instant)>,
}

/// Process-local job store, used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn item(&self, item_id: Uuid) -> Option<BulkItem> {
        self.state.lock().await.items.get(&item_id).cloned()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStore {
    async fn create_job(&self, job: &BulkJob, items: &[BulkItem]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        state
            .job_items
            .insert(job.id, items.iter().map(|i| i.id).collect());
        for item in items {
            state.items.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn load_with_items(&self, job_id: Uuid) -> Result<Option<JobWithItems>, StoreError> {
        let state = self.state.lock().await;
        let Some(job) = state.jobs.get(&job_id).cloned() else {
            return Ok(None);
        };

        let items = state
            .job_items
            .get(&job_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.items.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(JobWithItems { job, items }))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        change: &StatusChange,
    ) -> Result<Transition, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound { job_id })?;

        if job.status.is_terminal() {
            return Ok(Transition::AlreadyTerminal(job.status));
        }
        change.apply(job);
        Ok(Transition::Applied)
    }

    async fn update_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error_message: Option<String>,
        notification_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or(StoreError::ItemNotFound { item_id })?;

        item.apply_status(status, error_message, notification_id, Utc::now());
        Ok(())
    }

    async fn increment_counters(
        &self,
        job_id: Uuid,
        processed: u64,
        success: u64,
        failed: u64,
    ) -> Result<BulkJobStatus, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound { job_id })?;

        job.processed_count += processed;
        job.success_count += success;
        job.failed_count += failed;
        Ok(job.status)
    }

    async fn append_error(&self, job_id: Uuid, line: String) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound { job_id })?;

        job.error_messages.push(line);
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        job_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some((current, expires_at)) = state.leases.get(&job_id) {
            if *expires_at > now && current != holder {
                return Ok(Lease::HeldBy(current.clone()));
            }
        }

        state
            .leases
            .insert(job_id, (holder.to_string(), now + ttl));
        Ok(Lease::Acquired)
    }

    async fn release_lease(&self, job_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let owned = matches!(state.leases.get(&job_id), Some((current, _)) if current == holder);
        if owned {
            state.leases.remove(&job_id);
        }
        Ok(owned)
    }
}

/// Redis job store.
#[derive(Clone)]
pub struct RedisJobStore {
    connection: ConnectionManager,
    transition_script: Script,
    increment_script: Script,
    append_error_script: Script,
    acquire_lease_script: Script,
    release_lease_script: Script,
}

impl RedisJobStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            transition_script: Script::new(TRANSITION_SCRIPT),
            increment_script: Script::new(INCREMENT_SCRIPT),
            append_error_script: Script::new(APPEND_ERROR_SCRIPT),
            acquire_lease_script: Script::new(ACQUIRE_LEASE_SCRIPT),
            release_lease_script: Script::new(RELEASE_LEASE_SCRIPT),
        }
    }

    fn job_key(job_id: Uuid) -> String {
        format!("{}{}", JOB_PREFIX, job_id)
    }

    fn items_key(job_id: Uuid) -> String {
        format!("{}{}:items", JOB_PREFIX, job_id)
    }

    fn errors_key(job_id: Uuid) -> String {
        format!("{}{}:errors", JOB_PREFIX, job_id)
    }

    fn lease_key(job_id: Uuid) -> String {
        format!("{}{}:lease", JOB_PREFIX, job_id)
    }

    fn item_key(item_id: Uuid) -> String {
        format!("{}{}", ITEM_PREFIX, item_id)
    }

    fn job_fields(job: &BulkJob) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", job.id.to_string()),
            ("name", job.name.clone()),
            ("status", job.status.as_str().to_string()),
            ("total_count", job.total_count.to_string()),
            ("processed_count", job.processed_count.to_string()),
            ("success_count", job.success_count.to_string()),
            ("failed_count", job.failed_count.to_string()),
            ("created_at", job.created_at.to_rfc3339()),
        ];
        if let Some(description) = &job.description {
            fields.push(("description", description.clone()));
        }
        if let Some(started_at) = job.started_at {
            fields.push(("started_at", started_at.to_rfc3339()));
        }
        if let Some(completed_at) = job.completed_at {
            fields.push(("completed_at", completed_at.to_rfc3339()));
        }
        fields
    }

    async fn read_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, StoreError> {
        let (fields, errors): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(Self::job_key(job_id))
            .lrange(Self::errors_key(job_id), 0, -1)
            .query_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let mut job = parse_job(&fields)?;
        job.error_messages = errors;
        Ok(Some(job))
    }

    async fn read_item(&self, item_id: Uuid) -> Result<BulkItem, StoreError> {
        let json: Option<String> = self
            .connection
            .clone()
            .get(Self::item_key(item_id))
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        let json = json.ok_or(StoreError::ItemNotFound { item_id })?;
        serde_json::from_str(&json).map_err(|e| StoreError::SerializationFailed(e.to_string()))
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::SerializationFailed(format!("job hash missing '{}'", name)))
}

fn parse_count(fields: &HashMap<String, String>, name: &str) -> Result<u64, StoreError> {
    match fields.get(name) {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            StoreError::SerializationFailed(format!("invalid {} '{}'", name, raw))
        }),
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::SerializationFailed(format!("invalid timestamp '{}': {}", raw, e)))
}

fn parse_job(fields: &HashMap<String, String>) -> Result<BulkJob, StoreError> {
    let id = required(fields, "id")?
        .parse()
        .map_err(|e: uuid::Error| StoreError::SerializationFailed(e.to_string()))?;

    Ok(BulkJob {
        id,
        name: required(fields, "name")?.to_string(),
        description: fields.get("description").cloned(),
        status: required(fields, "status")?.parse()?,
        total_count: parse_count(fields, "total_count")?,
        processed_count: parse_count(fields, "processed_count")?,
        success_count: parse_count(fields, "success_count")?,
        failed_count: parse_count(fields, "failed_count")?,
        started_at: fields.get("started_at").map(|t| parse_time(t)).transpose()?,
        completed_at: fields.get("completed_at").map(|t| parse_time(t)).transpose()?,
        created_at: parse_time(required(fields, "created_at")?)?,
        error_messages: Vec::new(),
    })
}

#[async_trait]
impl JobRepository for RedisJobStore {
    async fn create_job(&self, job: &BulkJob, items: &[BulkItem]) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(Self::job_key(job.id))
            .ignore()
            .hset_multiple(Self::job_key(job.id), &Self::job_fields(job))
            .ignore()
            .del(Self::items_key(job.id))
            .ignore()
            .del(Self::errors_key(job.id))
            .ignore();

        for item in items {
            let json = serde_json::to_string(item)
                .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
            pipe.set(Self::item_key(item.id), json)
                .ignore()
                .rpush(Self::items_key(job.id), item.id.to_string())
                .ignore();
        }
        for line in &job.error_messages {
            pipe.rpush(Self::errors_key(job.id), line).ignore();
        }

        pipe.query_async::<_, ()>(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        debug!(job_id = %job.id, items = items.len(), "Stored bulk job");
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<BulkJob>, StoreError> {
        self.read_job(job_id).await
    }

    async fn load_with_items(&self, job_id: Uuid) -> Result<Option<JobWithItems>, StoreError> {
        let Some(job) = self.read_job(job_id).await? else {
            return Ok(None);
        };

        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .lrange(Self::items_key(job_id), 0, -1)
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        if ids.is_empty() {
            return Ok(Some(JobWithItems {
                job,
                items: Vec::new(),
            }));
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}{}", ITEM_PREFIX, id))
            .collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::ReadFailed(e.to_string()))?;

        let items = raw
            .into_iter()
            .flatten()
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| StoreError::SerializationFailed(e.to_string()))
            })
            .collect::<Result<Vec<BulkItem>, _>>()?;

        Ok(Some(JobWithItems { job, items }))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        change: &StatusChange,
    ) -> Result<Transition, StoreError> {
        let time = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        let (processed, success, failed): (String, String, String) = match change.counts {
            Some(c) => (
                c.processed.to_string(),
                c.success.to_string(),
                c.failed.to_string(),
            ),
            None => Default::default(),
        };

        let (code, status): (i64, String) = self
            .transition_script
            .key(Self::job_key(job_id))
            .arg(change.status.as_str())
            .arg(time(change.started_at))
            .arg(time(change.completed_at))
            .arg(processed)
            .arg(success)
            .arg(failed)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        match code {
            0 => Err(StoreError::JobNotFound { job_id }),
            1 => Ok(Transition::Applied),
            _ => Ok(Transition::AlreadyTerminal(status.parse()?)),
        }
    }

    async fn update_item_status(
        &self,
        item_id: Uuid,
        status: ItemStatus,
        error_message: Option<String>,
        notification_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut item = self.read_item(item_id).await?;
        item.apply_status(status, error_message, notification_id, Utc::now());

        let json = serde_json::to_string(&item)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
        self.connection
            .clone()
            .set::<_, _, ()>(Self::item_key(item_id), json)
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))
    }

    async fn increment_counters(
        &self,
        job_id: Uuid,
        processed: u64,
        success: u64,
        failed: u64,
    ) -> Result<BulkJobStatus, StoreError> {
        let status: String = self
            .increment_script
            .key(Self::job_key(job_id))
            .arg(processed)
            .arg(success)
            .arg(failed)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        if status.is_empty() {
            return Err(StoreError::JobNotFound { job_id });
        }
        status.parse()
    }

    async fn append_error(&self, job_id: Uuid, line: String) -> Result<(), StoreError> {
        let appended: i64 = self
            .append_error_script
            .key(Self::job_key(job_id))
            .key(Self::errors_key(job_id))
            .arg(line)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        if appended == 0 {
            return Err(StoreError::JobNotFound { job_id });
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        job_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let current: String = self
            .acquire_lease_script
            .key(Self::lease_key(job_id))
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        if current.is_empty() {
            Ok(Lease::Acquired)
        } else {
            Ok(Lease::HeldBy(current))
        }
    }

    async fn release_lease(&self, job_id: Uuid, holder: &str) -> Result<bool, StoreError> {
        let released: i64 = self
            .release_lease_script
            .key(Self::lease_key(job_id))
            .arg(holder)
            .invoke_async(&mut self.connection.clone())
            .await
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::job::JobCounts;
    use crate::delivery::ChannelKind;
    use tokio_test::{assert_err, assert_ok};

    async fn seeded() -> (InMemoryJobStore, BulkJob, Vec<BulkItem>) {
        let store = InMemoryJobStore::new();
        let job = BulkJob::new("welcome", 2);
        let items = vec![
            BulkItem::new(job.id, "a@example.com", ChannelKind::Email),
            BulkItem::new(job.id, "+15550100", ChannelKind::Sms),
        ];
        store.create_job(&job, &items).await.unwrap();
        (store, job, items)
    }

    #[tokio::test]
    async fn loads_items_in_creation_order() {
        let (store, job, items) = seeded().await;

        let loaded = store.load_with_items(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.job, job);
        assert_eq!(loaded.items, items);
        assert!(store.load_with_items(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counters_accumulate() {
        let (store, job, _) = seeded().await;

        assert_ok!(store.increment_counters(job.id, 1, 1, 0).await);
        let status = assert_ok!(store.increment_counters(job.id, 1, 0, 1).await);
        assert_eq!(status, BulkJobStatus::Pending);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(
            (job.processed_count, job.success_count, job.failed_count),
            (2, 1, 1)
        );
        assert_err!(store.increment_counters(Uuid::new_v4(), 1, 1, 0).await);
    }

    #[tokio::test]
    async fn transition_keeps_existing_timestamps() {
        let (store, job, _) = seeded().await;
        let started = Utc::now();

        let first = store.transition(job.id, &StatusChange::start(started)).await;
        let counts = JobCounts {
            processed: 2,
            success: 1,
            failed: 1,
        };
        let second = store
            .transition(job.id, &StatusChange::complete(Utc::now(), counts))
            .await;

        assert_eq!(first.unwrap(), Transition::Applied);
        assert_eq!(second.unwrap(), Transition::Applied);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, BulkJobStatus::Completed);
        assert_eq!(job.started_at, Some(started));
        assert!(job.completed_at.is_some());
        assert_eq!(
            (job.processed_count, job.success_count, job.failed_count),
            (2, 1, 1)
        );
    }

    #[tokio::test]
    async fn finished_jobs_ignore_transitions() {
        let (store, job, _) = seeded().await;
        store.transition(job.id, &StatusChange::cancel()).await.unwrap();

        let counts = JobCounts {
            processed: 2,
            success: 2,
            failed: 0,
        };
        let result = store
            .transition(job.id, &StatusChange::complete(Utc::now(), counts))
            .await
            .unwrap();

        assert_eq!(result, Transition::AlreadyTerminal(BulkJobStatus::Cancelled));
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, BulkJobStatus::Cancelled);
        assert_eq!(job.processed_count, 0);
        assert!(job.completed_at.is_none());
        assert_eq!(
            store.increment_counters(job.id, 0, 0, 0).await.unwrap(),
            BulkJobStatus::Cancelled
        );
        assert!(matches!(
            store.transition(Uuid::new_v4(), &StatusChange::cancel()).await,
            Err(StoreError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_item_is_reported() {
        let store = InMemoryJobStore::new();
        let item_id = Uuid::new_v4();

        let result = store
            .update_item_status(item_id, ItemStatus::Sent, None, None)
            .await;
        assert!(matches!(result, Err(StoreError::ItemNotFound { item_id: id }) if id == item_id));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_exclusive_until_it_expires() {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.try_acquire_lease(job_id, "worker-a", ttl).await.unwrap(),
            Lease::Acquired
        );
        assert_eq!(
            store.try_acquire_lease(job_id, "worker-a", ttl).await.unwrap(),
            Lease::Acquired
        );
        assert_eq!(
            store.try_acquire_lease(job_id, "worker-b", ttl).await.unwrap(),
            Lease::HeldBy("worker-a".into())
        );
        assert!(!store.release_lease(job_id, "worker-b").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(
            store.try_acquire_lease(job_id, "worker-b", ttl).await.unwrap(),
            Lease::Acquired
        );
        assert!(store.release_lease(job_id, "worker-b").await.unwrap());
    }

    #[test]
    fn job_hash_round_trips_through_fields() {
        let mut job = BulkJob::new("digest", 10);
        job.description = Some("weekly".into());
        job.processed_count = 4;
        job.started_at = Some(Utc::now());

        let fields: HashMap<String, String> = RedisJobStore::job_fields(&job)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(parse_job(&fields).unwrap(), job);
    }
}
