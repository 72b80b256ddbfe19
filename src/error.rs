//! Error types for the delivery pipeline.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::retry::FailureKind;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Message broker errors.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Failed to declare '{queue}': {message}")]
    DeclareFailed { queue: String, message: String },

    #[error("Failed to publish to '{queue}': {message}")]
    PublishFailed { queue: String, message: String },

    #[error("Failed to receive from '{queue}': {message}")]
    ReceiveFailed { queue: String, message: String },

    #[error("Failed to settle delivery {delivery_tag} on '{queue}': {message}")]
    SettleFailed {
        queue: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Unknown delivery tag {delivery_tag} on '{queue}'")]
    UnknownDeliveryTag { queue: String, delivery_tag: u64 },

    #[error("Failed to purge '{queue}': {message}")]
    PurgeFailed { queue: String, message: String },

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(String),
}

/// Job, item and dispatch-record storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to store at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Store read failed: {0}")]
    ReadFailed(String),

    #[error("Store write failed: {0}")]
    WriteFailed(String),

    #[error("Failed to (de)serialize stored record: {0}")]
    SerializationFailed(String),

    #[error("Bulk job not found: {job_id}")]
    JobNotFound { job_id: Uuid },

    #[error("Bulk item not found: {item_id}")]
    ItemNotFound { item_id: Uuid },

    #[error("Dispatch {channel_id} not found on notification {notification_id}")]
    DispatchNotFound {
        notification_id: Uuid,
        channel_id: Uuid,
    },

    #[error("Dispatch {channel_id} is a {actual} channel, not {expected}")]
    ChannelMismatch {
        channel_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Cannot cancel job {job_id} in terminal status {status}")]
    TerminalJob { job_id: Uuid, status: String },
}

/// Failures raised while handling a single message.
///
/// Every variant maps onto a [`FailureKind`] which the retry policy uses to
/// decide whether another attempt is worthwhile.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rejected request with HTTP {status}: {body}")]
    ProviderRejected { status: u16, body: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported channel type: {0}")]
    UnsupportedChannel(String),

    #[error("Bulk job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error("Bulk job {job_id} is being processed by {holder}")]
    LeaseHeld { job_id: Uuid, holder: String },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Classifies this failure for the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Io(_) => FailureKind::Io,
            Self::Network(_) => FailureKind::Network,
            Self::Http(e) if e.is_timeout() => FailureKind::Timeout,
            Self::Http(e) if e.is_decode() || e.is_builder() => FailureKind::InvalidData,
            Self::Http(_) => FailureKind::Network,
            Self::ProviderRejected { status, .. } => match status {
                408 => FailureKind::Timeout,
                429 | 500..=599 => FailureKind::Network,
                _ => FailureKind::InvalidData,
            },
            Self::InvalidPayload(_) => FailureKind::InvalidData,
            Self::UnsupportedChannel(_) => FailureKind::Unsupported,
            Self::JobNotFound { .. } => FailureKind::NotFound,
            Self::LeaseHeld { .. } => FailureKind::Busy,
            Self::Broker(BrokerError::SerializationFailed(_)) => FailureKind::InvalidData,
            Self::Broker(_) => FailureKind::Network,
            Self::Store(StoreError::SerializationFailed(_)) => FailureKind::InvalidData,
            Self::Store(StoreError::JobNotFound { .. } | StoreError::ItemNotFound { .. }) => {
                FailureKind::NotFound
            }
            Self::Store(StoreError::DispatchNotFound { .. }) => FailureKind::NotFound,
            Self::Store(StoreError::ChannelMismatch { .. } | StoreError::TerminalJob { .. }) => {
                FailureKind::InvalidData
            }
            Self::Store(_) => FailureKind::Io,
            Self::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Metrics and alerting errors.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Alert webhook failed: {0}")]
    WebhookFailed(String),

    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),

    #[error("HTTP request failed: {0}")]
    HttpFailed(#[from] reqwest::Error),
}
