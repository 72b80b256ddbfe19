//! Per-recipient dispatch records.
//!
//! A record belongs to one notification and holds one typed dispatch per
//! channel. Status updates are routed with a closed match over the channel
//! kind, never by looking the payload type up at runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::{ChannelMessage, EmailMessage, PushMessage, SmsMessage};
use super::status::DispatchTarget;
use super::{ChannelKind, NotificationStatus};
use crate::error::StoreError;

/// Delivery state shared by every channel dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchState {
    pub status: NotificationStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchState {
    fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Pending,
            error_message: None,
            sent_at: None,
            updated_at: now,
        }
    }

    fn apply(
        &mut self,
        status: NotificationStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.error_message = error_message;
        if status == NotificationStatus::Sent {
            self.sent_at = Some(now);
        }
        self.updated_at = now;
    }
}

/// One channel's dispatch, keeping the typed payload that was queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum ChannelDispatch {
    Email {
        message: EmailMessage,
        state: DispatchState,
    },
    Sms {
        message: SmsMessage,
        state: DispatchState,
    },
    Push {
        message: PushMessage,
        state: DispatchState,
    },
}

impl ChannelDispatch {
    pub fn new(message: ChannelMessage, now: DateTime<Utc>) -> Self {
        let state = DispatchState::pending(now);
        match message {
            ChannelMessage::Email(message) => Self::Email { message, state },
            ChannelMessage::Sms(message) => Self::Sms { message, state },
            ChannelMessage::Push(message) => Self::Push { message, state },
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email { .. } => ChannelKind::Email,
            Self::Sms { .. } => ChannelKind::Sms,
            Self::Push { .. } => ChannelKind::Push,
        }
    }

    pub fn channel_id(&self) -> Uuid {
        match self {
            Self::Email { message, .. } => message.channel_id,
            Self::Sms { message, .. } => message.channel_id,
            Self::Push { message, .. } => message.channel_id,
        }
    }

    pub fn state(&self) -> &DispatchState {
        match self {
            Self::Email { state, .. } | Self::Sms { state, .. } | Self::Push { state, .. } => {
                state
            }
        }
    }

    /// The queued payload, rebuilt as a [`ChannelMessage`].
    pub fn message(&self) -> ChannelMessage {
        match self {
            Self::Email { message, .. } => ChannelMessage::Email(message.clone()),
            Self::Sms { message, .. } => ChannelMessage::Sms(message.clone()),
            Self::Push { message, .. } => ChannelMessage::Push(message.clone()),
        }
    }
}

fn update_email(state: &mut DispatchState, status: NotificationStatus, error: Option<String>) {
    state.apply(status, error, Utc::now());
}

fn update_sms(state: &mut DispatchState, status: NotificationStatus, error: Option<String>) {
    state.apply(status, error, Utc::now());
}

fn update_push(state: &mut DispatchState, status: NotificationStatus, error: Option<String>) {
    // Push providers reject overlong reasons; keep what operators need.
    let error = error.map(|e| truncate(&e, 512));
    state.apply(status, error, Utc::now());
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

/// A notification and its channel dispatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub notification_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dispatches: Vec<ChannelDispatch>,
}

impl DispatchRecord {
    /// Creates a record with a single pending dispatch for `message`.
    pub fn for_message(message: ChannelMessage) -> Self {
        let now = Utc::now();
        Self {
            notification_id: message.target().notification_id,
            created_at: now,
            dispatches: vec![ChannelDispatch::new(message, now)],
        }
    }

    pub fn dispatch(&self, channel_id: Uuid) -> Option<&ChannelDispatch> {
        self.dispatches.iter().find(|d| d.channel_id() == channel_id)
    }

    /// Applies a status update to the dispatch named by `target`.
    pub fn apply_status(
        &mut self,
        target: &DispatchTarget,
        status: NotificationStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let dispatch = self
            .dispatches
            .iter_mut()
            .find(|d| d.channel_id() == target.channel_id)
            .ok_or(StoreError::DispatchNotFound {
                notification_id: target.notification_id,
                channel_id: target.channel_id,
            })?;

        match (target.channel, dispatch) {
            (ChannelKind::Email, ChannelDispatch::Email { state, .. }) => {
                update_email(state, status, error_message)
            }
            (ChannelKind::Sms, ChannelDispatch::Sms { state, .. }) => {
                update_sms(state, status, error_message)
            }
            (ChannelKind::Push, ChannelDispatch::Push { state, .. }) => {
                update_push(state, status, error_message)
            }
            (expected, other) => {
                return Err(StoreError::ChannelMismatch {
                    channel_id: target.channel_id,
                    expected: expected.to_string(),
                    actual: other.kind().to_string(),
                })
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> EmailMessage {
        EmailMessage {
            channel_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            to: "ops@example.com".into(),
            subject: "Deploy".into(),
            body: "Finished".into(),
            is_body_html: false,
        }
    }

    #[test]
    fn sent_status_stamps_sent_at() {
        let message = email();
        let mut record = DispatchRecord::for_message(ChannelMessage::Email(message.clone()));
        let target = ChannelMessage::Email(message.clone()).target();

        record
            .apply_status(&target, NotificationStatus::Sent, None)
            .unwrap();

        let state = record.dispatch(message.channel_id).unwrap().state();
        assert_eq!(state.status, NotificationStatus::Sent);
        assert!(state.sent_at.is_some());
    }

    #[test]
    fn wrong_channel_kind_is_rejected() {
        let message = email();
        let mut record = DispatchRecord::for_message(ChannelMessage::Email(message.clone()));
        let target = DispatchTarget {
            notification_id: message.notification_id,
            channel_id: message.channel_id,
            channel: ChannelKind::Sms,
        };

        let err = record
            .apply_status(&target, NotificationStatus::Failed, Some("boom".into()))
            .unwrap_err();
        assert!(matches!(err, StoreError::ChannelMismatch { .. }));
    }

    #[test]
    fn unknown_dispatch_is_reported() {
        let message = email();
        let mut record = DispatchRecord::for_message(ChannelMessage::Email(message.clone()));
        let target = DispatchTarget {
            notification_id: message.notification_id,
            channel_id: Uuid::new_v4(),
            channel: ChannelKind::Email,
        };

        let err = record
            .apply_status(&target, NotificationStatus::Failed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::DispatchNotFound { .. }));
    }

    #[test]
    fn push_failure_reason_is_truncated() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
