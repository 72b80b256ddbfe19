//! Bulk job and item model.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::ChannelKind;
use crate::error::StoreError;

/// Lifecycle of a bulk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkJobStatus {
    Draft,
    Scheduled,
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BulkJobStatus {
    /// Completed, Failed and Cancelled jobs are never touched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BulkJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkJobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::SerializationFailed(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Per-recipient item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Sent,
    Failed,
    Scheduled,
    Cancelled,
    Recurring,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::Recurring => "recurring",
        };
        f.write_str(s)
    }
}

/// Channel as stored on an item.
///
/// Items are written by an upstream creation path, so an unknown channel
/// name is kept as-is and fails only that item when it is dispatched.
/// Known names match case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemChannel {
    Known(ChannelKind),
    Unsupported(String),
}

impl From<String> for ItemChannel {
    fn from(name: String) -> Self {
        match name.parse::<ChannelKind>() {
            Ok(kind) => Self::Known(kind),
            Err(_) => Self::Unsupported(name),
        }
    }
}

impl From<ItemChannel> for String {
    fn from(channel: ItemChannel) -> Self {
        match channel {
            ItemChannel::Known(kind) => kind.to_string(),
            ItemChannel::Unsupported(name) => name,
        }
    }
}

impl From<ChannelKind> for ItemChannel {
    fn from(kind: ChannelKind) -> Self {
        Self::Known(kind)
    }
}

impl fmt::Display for ItemChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(kind) => write!(f, "{}", kind),
            Self::Unsupported(name) => f.write_str(name),
        }
    }
}

/// One recipient of a bulk job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Address, phone number or device token depending on the channel.
    pub recipient: String,
    pub channel: ItemChannel,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    /// Dispatch record created for this item.
    #[serde(default)]
    pub notification_id: Option<Uuid>,
}

impl BulkItem {
    pub fn new(job_id: Uuid, recipient: impl Into<String>, channel: impl Into<ItemChannel>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            recipient: recipient.into(),
            channel: channel.into(),
            variables: HashMap::new(),
            status: ItemStatus::Pending,
            error_message: None,
            sent_at: None,
            notification_id: None,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Applies an item status change in place.
    pub fn apply_status(
        &mut self,
        status: ItemStatus,
        error_message: Option<String>,
        notification_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        if error_message.is_some() {
            self.error_message = error_message;
        }
        if notification_id.is_some() {
            self.notification_id = notification_id;
        }
        if status == ItemStatus::Sent {
            self.sent_at = Some(now);
        }
    }
}

/// Aggregate job record. Items are stored separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJob {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: BulkJobStatus,
    pub total_count: u64,
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error_messages: Vec<String>,
}

impl BulkJob {
    /// Creates a pending job sized for `total_count` items.
    pub fn new(name: impl Into<String>, total_count: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            status: BulkJobStatus::Pending,
            total_count,
            processed_count: 0,
            success_count: 0,
            failed_count: 0,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            error_messages: Vec::new(),
        }
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            job_id: self.id,
            name: self.name.clone(),
            status: self.status,
            total_count: self.total_count,
            processed_count: self.processed_count,
            success_count: self.success_count,
            failed_count: self.failed_count,
            percent_complete: percent_complete(self.processed_count, self.total_count),
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        }
    }
}

/// Job counters derived from item statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Sent items are successes, Failed items failures. Nothing else counts.
    pub fn from_items(items: &[BulkItem]) -> Self {
        items.iter().fold(Self::default(), |mut counts, item| {
            match item.status {
                ItemStatus::Sent => counts.success += 1,
                ItemStatus::Failed => counts.failed += 1,
                _ => return counts,
            }
            counts.processed += 1;
            counts
        })
    }
}

/// A status change for a job that has not finished yet.
///
/// Stores apply it only while the job is non-terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: BulkJobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Replaces the job counters when set.
    pub counts: Option<JobCounts>,
}

impl StatusChange {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            status: BulkJobStatus::Processing,
            started_at: Some(started_at),
            completed_at: None,
            counts: None,
        }
    }

    pub fn complete(completed_at: DateTime<Utc>, counts: JobCounts) -> Self {
        Self {
            status: BulkJobStatus::Completed,
            started_at: None,
            completed_at: Some(completed_at),
            counts: Some(counts),
        }
    }

    pub fn cancel() -> Self {
        Self {
            status: BulkJobStatus::Cancelled,
            started_at: None,
            completed_at: None,
            counts: None,
        }
    }

    pub fn apply(&self, job: &mut BulkJob) {
        job.status = self.status;
        if self.started_at.is_some() {
            job.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            job.completed_at = self.completed_at;
        }
        if let Some(counts) = self.counts {
            job.processed_count = counts.processed;
            job.success_count = counts.success;
            job.failed_count = counts.failed;
        }
    }
}

/// Result of a conditional status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job had already finished with this status and was left alone.
    AlreadyTerminal(BulkJobStatus),
}

/// A job together with its items, in creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobWithItems {
    pub job: BulkJob,
    pub items: Vec<BulkItem>,
}

/// Point-in-time progress view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: Uuid,
    pub name: String,
    pub status: BulkJobStatus,
    pub total_count: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub percent_complete: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for JobProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} {}/{} ({:.2}%), {} succeeded, {} failed",
            self.name,
            self.job_id,
            self.status,
            self.processed_count,
            self.total_count,
            self.percent_complete,
            self.success_count,
            self.failed_count
        )
    }
}

/// `processed / total * 100`, 0 for an empty job.
pub fn percent_complete(processed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        processed as f64 / total as f64 * 100.0
    }
}

/// Formats a job error-log line as `"YYYY-mm-dd HH:MM:SS: message"`.
pub fn error_line(now: DateTime<Utc>, message: &str) -> String {
    format!("{}: {}", now.format("%Y-%m-%d %H:%M:%S"), message)
}
