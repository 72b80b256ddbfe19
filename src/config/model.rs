//! Configuration data structures.

use serde::{Deserialize, Serialize};

use crate::delivery::ChannelKind;

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue-level and in-process retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Receive loop settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Main queue names.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Bulk job processing settings.
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Channel delivery endpoints.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Dead-letter queue monitoring.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Queue-level attempts including the first (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Immediate retries made in-process before a failure reaches the queue tier.
    #[serde(default = "default_in_process_max_retries")]
    pub in_process_max_retries: u32,

    /// Backoff before the first in-process retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Dead-letter non-transient failures without spending the queue budget.
    #[serde(default)]
    pub fail_fast_terminal: bool,
}

/// What to do with a message whose body cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Acknowledge and discard.
    #[default]
    Drop,
    /// Reject so the dead-letter binding keeps it.
    DeadLetter,
}

/// Receive loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Sleep between polls of an empty queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub on_malformed: MalformedPolicy,

    /// Wrap channel handlers in in-process retries.
    #[serde(default)]
    pub in_process_retry: bool,

    /// A delivery left unsettled this long (its consumer died) is handed
    /// out again. Must exceed the slowest handler, including bulk runs.
    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: u64,

    /// How often each consumer looks for expired deliveries.
    #[serde(default = "default_requeue_interval_seconds")]
    pub requeue_interval_seconds: u64,
}

/// Main queue names. Each gets a `-dlx` exchange and `-dlq` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_email_queue")]
    pub email: String,

    #[serde(default = "default_sms_queue")]
    pub sms: String,

    #[serde(default = "default_push_queue")]
    pub push: String,

    #[serde(default = "default_bulk_queue")]
    pub bulk: String,
}

impl QueuesConfig {
    pub fn for_channel(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Email => &self.email,
            ChannelKind::Sms => &self.sms,
            ChannelKind::Push => &self.push,
        }
    }

    /// All main queues, channels first.
    pub fn all(&self) -> [&str; 4] {
        [&self.email, &self.sms, &self.push, &self.bulk]
    }
}

/// Bulk job processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Log progress every this many processed items.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// How long a worker's claim on a job lasts.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

/// Channel delivery endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub email_webhook_url: Option<String>,

    #[serde(default)]
    pub sms_webhook_url: Option<String>,

    #[serde(default)]
    pub push_webhook_url: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_channel_timeout")]
    pub timeout_seconds: u64,
}

/// Dead-letter queue monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub interval_seconds: u64,

    /// Depth at which a queue is reported as alerting. 0 disables alerts.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,

    /// Optional webhook (Discord-compatible) for alerts.
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to enable Prometheus metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the Prometheus metrics HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_max_attempts() -> u32 {
    3
}

fn default_in_process_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_visibility_timeout_seconds() -> u64 {
    1800
}

fn default_requeue_interval_seconds() -> u64 {
    60
}

fn default_email_queue() -> String {
    "email-notifications".to_string()
}

fn default_sms_queue() -> String {
    "sms-notifications".to_string()
}

fn default_push_queue() -> String {
    "push-notifications".to_string()
}

fn default_bulk_queue() -> String {
    "bulk-notifications".to_string()
}

fn default_progress_interval() -> u64 {
    100
}

fn default_lease_seconds() -> u64 {
    900
}

fn default_channel_timeout() -> u64 {
    30
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_alert_threshold() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            redis: RedisConfig::default(),
            retry: RetryConfig::default(),
            consumer: ConsumerConfig::default(),
            queues: QueuesConfig::default(),
            bulk: BulkConfig::default(),
            channels: ChannelsConfig::default(),
            monitor: MonitorConfig::default(),
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            in_process_max_retries: default_in_process_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            fail_fast_terminal: false,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            on_malformed: MalformedPolicy::Drop,
            in_process_retry: false,
            visibility_timeout_seconds: default_visibility_timeout_seconds(),
            requeue_interval_seconds: default_requeue_interval_seconds(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            email: default_email_queue(),
            sms: default_sms_queue(),
            push: default_push_queue(),
            bulk: default_bulk_queue(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            progress_interval: default_progress_interval(),
            lease_seconds: default_lease_seconds(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email_webhook_url: None,
            sms_webhook_url: None,
            push_webhook_url: None,
            timeout_seconds: default_channel_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_monitor_interval(),
            alert_threshold: default_alert_threshold(),
            alert_webhook_url: None,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_prometheus_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 2_000);
        assert_eq!(config.consumer.on_malformed, MalformedPolicy::Drop);
        assert_eq!(config.queues.for_channel(ChannelKind::Push), "push-notifications");
        assert_eq!(config.bulk.progress_interval, 100);
        assert!(config.monitor.enabled);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let yaml = r#"
retry:
  max_attempts: 5
consumer:
  on_malformed: dead_letter
queues:
  sms: texts
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.consumer.on_malformed, MalformedPolicy::DeadLetter);
        assert_eq!(config.queues.sms, "texts");
        assert_eq!(config.queues.email, "email-notifications");
    }
}
