//! Retry policy: whether to try again, and how long to wait first.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::model::RetryConfig;

/// Coarse classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation (or an outbound call) timed out.
    Timeout,
    /// The operation was cancelled before it finished.
    Cancelled,
    /// Local or storage I/O failed.
    Io,
    /// A network or remote-service error.
    Network,
    /// Another worker currently owns the unit of work.
    Busy,
    /// The payload is malformed or was rejected as invalid.
    InvalidData,
    /// The request asks for something this pipeline cannot do.
    Unsupported,
    /// A referenced record does not exist.
    NotFound,
    /// Any other failure.
    Internal,
}

impl FailureKind {
    /// Returns true for failures that are likely to succeed on a later attempt.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Cancelled | Self::Io | Self::Network | Self::Busy
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io => write!(f, "io"),
            Self::Network => write!(f, "network"),
            Self::Busy => write!(f, "busy"),
            Self::InvalidData => write!(f, "invalid_data"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::NotFound => write!(f, "not_found"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Decides whether a failed attempt should be retried.
///
/// Implementations must be pure functions of their inputs.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` is zero-based: the first failure is attempt 0.
    fn should_retry(&self, attempt: u32, kind: FailureKind) -> bool;

    /// Delay to wait before the attempt after `attempt`.
    fn retry_delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with a ceiling: `min(initial * 2^attempt, max)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Builds the in-process policy from the retry section of the config.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.in_process_max_retries,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(300))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, kind: FailureKind) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        kind.is_transient()
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
