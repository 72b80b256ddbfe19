//! Semantic validation for configuration values.

use crate::config::model::{AppConfig, BulkConfig, ConsumerConfig, MonitorConfig, RetryConfig};

use super::{ValidationIssue, ValidationResult};

/// Validates semantic correctness of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_retry(&config.retry, &mut result);
    validate_bulk(&config.bulk, &mut result);
    validate_monitor(&config.monitor, &mut result);
    validate_consumer(&config.consumer, &config.bulk, &mut result);

    if config.channels.timeout_seconds == 0 {
        result.add(ValidationIssue::error(
            "channels.timeout_seconds",
            "Channel timeout must be at least 1 second",
        ));
    }

    result
}

fn validate_retry(retry: &RetryConfig, result: &mut ValidationResult) {
    if retry.max_attempts == 0 {
        result.add(
            ValidationIssue::error("retry.max_attempts", "Max attempts must be at least 1")
                .with_suggestion("Use 1 to disable queue-level retries"),
        );
    }

    if retry.initial_delay_ms == 0 {
        result.add(ValidationIssue::error(
            "retry.initial_delay_ms",
            "Initial delay must be greater than 0",
        ));
    }

    if retry.initial_delay_ms > retry.max_delay_ms {
        result.add(ValidationIssue::error(
            "retry.initial_delay_ms",
            format!(
                "Initial delay {}ms exceeds max delay {}ms",
                retry.initial_delay_ms, retry.max_delay_ms
            ),
        ));
    }
}

fn validate_bulk(bulk: &BulkConfig, result: &mut ValidationResult) {
    if bulk.progress_interval == 0 {
        result.add(ValidationIssue::error(
            "bulk.progress_interval",
            "Progress interval must be at least 1",
        ));
    }

    if bulk.lease_seconds == 0 {
        result.add(
            ValidationIssue::error("bulk.lease_seconds", "Lease duration must be greater than 0")
                .with_suggestion("It is renewed every progress_interval items; pick a value longer than those take"),
        );
    }
}

fn validate_consumer(consumer: &ConsumerConfig, bulk: &BulkConfig, result: &mut ValidationResult) {
    if consumer.poll_interval_ms == 0 {
        result.add(
            ValidationIssue::warning(
                "consumer.poll_interval_ms",
                "Poll interval of 0 makes idle consumers spin",
            )
            .with_suggestion("Use at least 100ms"),
        );
    }

    if consumer.visibility_timeout_seconds == 0 {
        result.add(ValidationIssue::error(
            "consumer.visibility_timeout_seconds",
            "Visibility timeout must be at least 1 second",
        ));
    } else if consumer.visibility_timeout_seconds < bulk.lease_seconds {
        result.add(
            ValidationIssue::warning(
                "consumer.visibility_timeout_seconds",
                format!(
                    "Visibility timeout {}s is shorter than the bulk lease {}s; long bulk runs will be redelivered while still running",
                    consumer.visibility_timeout_seconds, bulk.lease_seconds
                ),
            )
            .with_suggestion("Set it above the longest expected bulk run"),
        );
    }

    if consumer.requeue_interval_seconds == 0 {
        result.add(ValidationIssue::error(
            "consumer.requeue_interval_seconds",
            "Requeue interval must be at least 1 second",
        ));
    }
}

fn validate_monitor(monitor: &MonitorConfig, result: &mut ValidationResult) {
    if monitor.enabled && monitor.interval_seconds == 0 {
        result.add(ValidationIssue::error(
            "monitor.interval_seconds",
            "Monitor interval must be at least 1 second",
        ));
    }

    if monitor.alert_threshold == 0 {
        result.add(ValidationIssue::warning(
            "monitor.alert_threshold",
            "Alert threshold of 0 disables dead-letter alerts",
        ));
    }
}
