//! Vendor-neutral HTTP sender.
//!
//! Each channel posts its message as JSON to a configured endpoint, which
//! fronts the actual email, SMS or push provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error};

use super::messages::ChannelMessage;
use super::sender::ChannelSender;
use super::ChannelKind;
use crate::config::model::ChannelsConfig;
use crate::error::DeliveryError;

/// Posts channel messages to per-channel webhook endpoints.
pub struct WebhookSender {
    email_url: Option<String>,
    sms_url: Option<String>,
    push_url: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(config: &ChannelsConfig) -> Result<Self, DeliveryError> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            email_url: config.email_webhook_url.clone(),
            sms_url: config.sms_webhook_url.clone(),
            push_url: config.push_webhook_url.clone(),
            timeout,
            client,
        })
    }

    fn endpoint(&self, kind: ChannelKind) -> Option<&str> {
        match kind {
            ChannelKind::Email => self.email_url.as_deref(),
            ChannelKind::Sms => self.sms_url.as_deref(),
            ChannelKind::Push => self.push_url.as_deref(),
        }
    }
}

/// Request body posted to the channel endpoint.
#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    message: &'a ChannelMessage,
    attempted_at: String,
}

#[async_trait]
impl ChannelSender for WebhookSender {
    async fn send(&self, message: &ChannelMessage) -> Result<(), DeliveryError> {
        let kind = message.kind();
        let url = self
            .endpoint(kind)
            .ok_or_else(|| DeliveryError::UnsupportedChannel(format!("{kind} (no endpoint)")))?;

        let payload = WebhookPayload {
            message,
            attempted_at: chrono::Utc::now().to_rfc3339(),
        };

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout {
                        seconds: self.timeout.as_secs(),
                    }
                } else {
                    DeliveryError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(channel = %kind, status = %status, body = %body, "Channel endpoint rejected message");
            return Err(DeliveryError::ProviderRejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(channel = %kind, recipient = %message.recipient(), "Message handed to provider");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::messages::SmsMessage;
    use uuid::Uuid;

    #[tokio::test]
    async fn channel_without_endpoint_is_unsupported() {
        let sender = WebhookSender::new(&ChannelsConfig {
            email_webhook_url: Some("http://localhost:9/email".into()),
            ..ChannelsConfig::default()
        })
        .unwrap();

        let message = ChannelMessage::Sms(SmsMessage {
            channel_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            to: "+15550100".into(),
            message: "hi".into(),
            sender_id: None,
        });

        let err = sender.send(&message).await.unwrap_err();
        assert!(matches!(err, DeliveryError::UnsupportedChannel(_)));
        assert!(!err.kind().is_transient());
    }
}
