//! Schema validation for configuration structure.

use std::collections::HashSet;

use regex::Regex;

use super::{ValidationIssue, ValidationResult};
use crate::config::model::AppConfig;
use crate::queue::broker::is_dead_letter_name;

const QUEUE_NAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._:-]*$";
const WEBHOOK_URL_PATTERN: &str = r"^https?://[^\s/?#]+\S*$";

fn matches(pattern: &str, value: &str) -> bool {
    Regex::new(pattern).map_or(false, |re| re.is_match(value))
}

/// Validates queue names and endpoint URLs.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    let queues = [
        ("queues.email", &config.queues.email),
        ("queues.sms", &config.queues.sms),
        ("queues.push", &config.queues.push),
        ("queues.bulk", &config.queues.bulk),
    ];

    let mut seen = HashSet::new();
    for (path, name) in queues {
        if name.trim().is_empty() {
            result.add(ValidationIssue::error(path, "Queue name cannot be empty"));
            continue;
        }

        if !matches(QUEUE_NAME_PATTERN, name) {
            result.add(
                ValidationIssue::error(path, format!("Invalid queue name: '{}'", name))
                    .with_suggestion("Use letters, digits, '.', '_', ':' or '-'"),
            );
        }

        if is_dead_letter_name(name) {
            result.add(
                ValidationIssue::error(
                    path,
                    format!("Queue name '{}' collides with dead-letter naming", name),
                )
                .with_suggestion("Main queue names must not end in '-dlq' or '-dlx'"),
            );
        }

        if !seen.insert(name.as_str()) {
            result.add(ValidationIssue::error(
                path,
                format!("Duplicate queue name: '{}'", name),
            ));
        }
    }

    let urls = [
        ("channels.email_webhook_url", &config.channels.email_webhook_url),
        ("channels.sms_webhook_url", &config.channels.sms_webhook_url),
        ("channels.push_webhook_url", &config.channels.push_webhook_url),
        ("monitor.alert_webhook_url", &config.monitor.alert_webhook_url),
    ];

    for (path, url) in urls {
        if let Some(url) = url {
            if !matches(WEBHOOK_URL_PATTERN, url) {
                result.add(
                    ValidationIssue::error(path, format!("Invalid webhook URL: '{}'", url))
                        .with_suggestion("URL must start with http:// or https://"),
                );
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes() {
        assert!(validate(&AppConfig::default()).is_valid());
    }

    #[test]
    fn duplicate_and_reserved_queue_names_are_errors() {
        let mut config = AppConfig::default();
        config.queues.sms = config.queues.email.clone();
        config.queues.push = "push-dlq".into();

        let result = validate(&config);
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn webhook_urls_must_be_http() {
        let mut config = AppConfig::default();
        config.channels.email_webhook_url = Some("ftp://mail.internal".into());
        config.monitor.alert_webhook_url = Some("https://hooks.example.com/dlq".into());

        let result = validate(&config);
        let errors: Vec<_> = result.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "channels.email_webhook_url");
    }
}
