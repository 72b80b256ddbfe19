//! Message bodies carried on the channel and bulk queues.
//!
//! Field names are camelCase on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::DispatchTarget;
use super::ChannelKind;

/// Asks the bulk worker to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJobMessage {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub channel_id: Uuid,
    pub notification_id: Uuid,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub is_body_html: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsMessage {
    pub channel_id: Uuid,
    pub notification_id: Uuid,
    pub to: String,
    pub message: String,
    #[serde(default)]
    pub sender_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushContent {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub click_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub channel_id: Uuid,
    pub notification_id: Uuid,
    /// Device token or topic.
    pub to: String,
    pub content: PushContent,
    #[serde(default)]
    pub data: HashMap<String, String>,
    pub platform: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub time_to_live: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub mutable_content: Option<bool>,
    #[serde(default)]
    pub content_available: Option<bool>,
}

/// A channel message of any kind, as handed to a [`ChannelSender`](super::ChannelSender).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum ChannelMessage {
    Email(EmailMessage),
    Sms(SmsMessage),
    Push(PushMessage),
}

impl ChannelMessage {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email(_) => ChannelKind::Email,
            Self::Sms(_) => ChannelKind::Sms,
            Self::Push(_) => ChannelKind::Push,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::Email(m) => &m.to,
            Self::Sms(m) => &m.to,
            Self::Push(m) => &m.to,
        }
    }

    pub fn target(&self) -> DispatchTarget {
        let (notification_id, channel_id) = match self {
            Self::Email(m) => (m.notification_id, m.channel_id),
            Self::Sms(m) => (m.notification_id, m.channel_id),
            Self::Push(m) => (m.notification_id, m.channel_id),
        };
        DispatchTarget {
            notification_id,
            channel_id,
            channel: self.kind(),
        }
    }
}

/// A typed channel payload consumed from one channel queue.
pub trait ChannelPayload:
    serde::de::DeserializeOwned + Serialize + Clone + Send + Sync + 'static
{
    const KIND: ChannelKind;

    fn into_message(self) -> ChannelMessage;

    fn ids(&self) -> (Uuid, Uuid);

    fn target(&self) -> DispatchTarget {
        let (notification_id, channel_id) = self.ids();
        DispatchTarget {
            notification_id,
            channel_id,
            channel: Self::KIND,
        }
    }
}

impl ChannelPayload for EmailMessage {
    const KIND: ChannelKind = ChannelKind::Email;

    fn into_message(self) -> ChannelMessage {
        ChannelMessage::Email(self)
    }

    fn ids(&self) -> (Uuid, Uuid) {
        (self.notification_id, self.channel_id)
    }
}

impl ChannelPayload for SmsMessage {
    const KIND: ChannelKind = ChannelKind::Sms;

    fn into_message(self) -> ChannelMessage {
        ChannelMessage::Sms(self)
    }

    fn ids(&self) -> (Uuid, Uuid) {
        (self.notification_id, self.channel_id)
    }
}

impl ChannelPayload for PushMessage {
    const KIND: ChannelKind = ChannelKind::Push;

    fn into_message(self) -> ChannelMessage {
        ChannelMessage::Push(self)
    }

    fn ids(&self) -> (Uuid, Uuid) {
        (self.notification_id, self.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_job_message_uses_camel_case() {
        let job_id = Uuid::new_v4();
        let json = serde_json::to_string(&BulkJobMessage { job_id }).unwrap();
        assert_eq!(json, format!(r#"{{"jobId":"{job_id}"}}"#));
    }

    #[test]
    fn email_message_accepts_missing_optional_fields() {
        let json = format!(
            r#"{{"channelId":"{}","notificationId":"{}","to":"a@example.com","subject":"Hi","body":"Hello"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let message: EmailMessage = serde_json::from_str(&json).unwrap();
        assert!(!message.is_body_html);
        assert_eq!(message.to, "a@example.com");
    }

    #[test]
    fn target_carries_channel_kind() {
        let sms = SmsMessage {
            channel_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            to: "+15550100".into(),
            message: "code 1234".into(),
            sender_id: None,
        };
        let target = sms.target();
        assert_eq!(target.channel, ChannelKind::Sms);
        assert_eq!(target.channel_id, sms.channel_id);
        assert_eq!(sms.clone().into_message().target(), target);
    }
}
