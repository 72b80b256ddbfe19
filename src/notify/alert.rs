//! Dead-letter alerts over a Discord-compatible webhook.

use serde::Serialize;
use tracing::{error, info};

use crate::error::NotificationError;
use crate::queue::QueueInfo;

/// Posts dead-letter queue alerts to a webhook.
pub struct DeadLetterAlerter {
    /// Webhook URL.
    webhook_url: String,
    /// HTTP client.
    client: reqwest::Client,
}

impl DeadLetterAlerter {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Reports the queues at or above `threshold`.
    pub async fn alert(&self, queues: &[QueueInfo], threshold: u64) -> Result<(), NotificationError> {
        if queues.is_empty() {
            return Ok(());
        }

        let total: u64 = queues.iter().map(|q| q.message_count).sum();
        let embed = AlertEmbed {
            title: "Dead-Letter Queues Need Attention".to_string(),
            color: 0x800000, // Dark red
            description: format!(
                "{} message(s) across {} queue(s), threshold {}",
                total,
                queues.len(),
                threshold
            ),
            fields: queues
                .iter()
                .map(|q| EmbedField {
                    name: truncate(&q.queue, 256),
                    value: format!("{} message(s), {} consumer(s)", q.message_count, q.consumer_count),
                    inline: true,
                })
                .collect(),
        };

        let payload = AlertPayload {
            embeds: vec![embed],
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Alert webhook failed");
            return Err(NotificationError::WebhookFailed(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        info!(queues = queues.len(), "Dead-letter alert sent");
        Ok(())
    }
}

/// Webhook payload.
#[derive(Serialize)]
struct AlertPayload {
    embeds: Vec<AlertEmbed>,
}

/// Embed structure.
#[derive(Serialize)]
struct AlertEmbed {
    title: String,
    color: u32,
    description: String,
    fields: Vec<EmbedField>,
}

/// Embed field.
#[derive(Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

/// Truncates a string to at most `max_chars` characters.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
