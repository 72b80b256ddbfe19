//! The narrow send interface.

use async_trait::async_trait;
use tracing::info;

use super::messages::ChannelMessage;
use crate::error::DeliveryError;

/// Hands a channel message to whatever transport delivers it.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, message: &ChannelMessage) -> Result<(), DeliveryError>;
}

/// Logs each message instead of delivering it. Used for dry runs.
#[derive(Debug, Default, Clone)]
pub struct LoggingSender;

#[async_trait]
impl ChannelSender for LoggingSender {
    async fn send(&self, message: &ChannelMessage) -> Result<(), DeliveryError> {
        let target = message.target();
        info!(
            channel = %message.kind(),
            notification_id = %target.notification_id,
            channel_id = %target.channel_id,
            recipient = %message.recipient(),
            "Dry run, message not sent"
        );
        Ok(())
    }
}
