//! Message envelope and the retry-count header protocol.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Queue-level retries so far. Absent means zero.
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// Set on messages moved back from a dead-letter queue by an operator.
pub const REPROCESSED_FROM_DLQ_HEADER: &str = "reprocessed-from-dlq";
/// Epoch seconds at which the message was reprocessed.
pub const REPROCESSED_AT_HEADER: &str = "reprocessed-at";

/// A header value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl HeaderValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Serialized body plus headers. Envelopes are always published persistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValue>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
            persistent: true,
        }
    }

    /// Serializes `message` as JSON into a fresh envelope.
    pub fn from_message<T: Serialize + ?Sized>(message: &T) -> Result<Self, BrokerError> {
        let body = serde_json::to_string(message)
            .map_err(|e| BrokerError::SerializationFailed(e.to_string()))?;
        Ok(Self::new(body))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    /// Current retry count. Missing, negative or unreadable values count as 0.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(HeaderValue::as_i64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Copy of this envelope for the next queue-level attempt.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(self.retry_count()) + 1),
        );
        next.persistent = true;
        next
    }

    /// Resets the retry budget and stamps reprocessing provenance.
    /// Other headers are kept.
    pub fn reset_for_reprocess(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.headers
            .insert(RETRY_COUNT_HEADER.to_string(), HeaderValue::Int(0));
        next.headers.insert(
            REPROCESSED_FROM_DLQ_HEADER.to_string(),
            HeaderValue::Bool(true),
        );
        next.headers.insert(
            REPROCESSED_AT_HEADER.to_string(),
            HeaderValue::Int(now.timestamp()),
        );
        next.persistent = true;
        next
    }

    pub fn is_reprocessed(&self) -> bool {
        matches!(
            self.header(REPROCESSED_FROM_DLQ_HEADER),
            Some(HeaderValue::Bool(true))
        )
    }
}
