//! Per-channel message handler.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::messages::ChannelPayload;
use super::sender::ChannelSender;
use super::status::{DispatchTarget, StatusUpdater};
use super::{ChannelKind, NotificationStatus};
use crate::error::DeliveryError;
use crate::queue::consumer::MessageHandler;

/// Consumes one channel queue: sends each message and marks its dispatch Sent.
pub struct ChannelHandler<P> {
    sender: Arc<dyn ChannelSender>,
    updater: Arc<dyn StatusUpdater>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: ChannelPayload> ChannelHandler<P> {
    pub fn new(sender: Arc<dyn ChannelSender>, updater: Arc<dyn StatusUpdater>) -> Self {
        Self {
            sender,
            updater,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P: ChannelPayload> MessageHandler for ChannelHandler<P> {
    type Message = P;

    fn name(&self) -> &str {
        match P::KIND {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
        }
    }

    async fn process(
        &self,
        message: &P,
        _cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let target = message.target();
        self.sender.send(&message.clone().into_message()).await?;

        // The message is already out; a failed status write must not trigger a resend.
        if let Err(e) = self
            .updater
            .update_channel_status(&target, NotificationStatus::Sent, None)
            .await
        {
            error!(
                notification_id = %target.notification_id,
                channel_id = %target.channel_id,
                error = %e,
                "Message sent but status update failed, manual intervention may be required"
            );
        } else {
            debug!(
                notification_id = %target.notification_id,
                channel_id = %target.channel_id,
                channel = %P::KIND,
                "Dispatch marked sent"
            );
        }

        Ok(())
    }

    fn correlation_ids(&self, message: &P) -> Option<DispatchTarget> {
        Some(message.target())
    }
}
