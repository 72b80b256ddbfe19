//! Per-recipient notification delivery: channel messages, dispatch records,
//! status updates and the narrow send interface.

pub mod handler;
pub mod messages;
pub mod record;
pub mod sender;
pub mod status;
pub mod store;
pub mod webhook;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

pub use handler::ChannelHandler;
pub use messages::{BulkJobMessage, ChannelMessage, EmailMessage, PushMessage, SmsMessage};
pub use record::{ChannelDispatch, DispatchRecord};
pub use sender::{ChannelSender, LoggingSender};
pub use status::{DispatchTarget, NotificationRepository, StatusUpdater};
pub use store::{InMemoryNotificationStore, RedisNotificationStore};
pub use webhook::WebhookSender;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Email, ChannelKind::Sms, ChannelKind::Push];
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
            Self::Push => write!(f, "push"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            other => Err(DeliveryError::UnsupportedChannel(other.to_string())),
        }
    }
}

/// Delivery status of a single channel dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
