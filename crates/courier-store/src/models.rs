//! Domain model structs persisted in the relay database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::protocol::{ChatSummary, MessageView};
use courier_shared::{ChatId, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known user, used only to resolve display names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation between exactly two users (or one user with themselves).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Lexicographically smaller participant.
    pub user_low: UserId,
    /// Lexicographically larger participant (equal to `user_low` for a
    /// self-chat).
    pub user_high: UserId,
    /// Body of the most recent message, if any.
    pub last_message: Option<String>,
    pub is_blocked: bool,
    pub blocked_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Chat {
    pub fn has_participant(&self, user: &UserId) -> bool {
        &self.user_low == user || &self.user_high == user
    }

    /// The other participant, seen from `user`. Returns `None` when `user`
    /// is not part of this chat.
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if &self.user_low == user {
            Some(&self.user_high)
        } else if &self.user_high == user {
            Some(&self.user_low)
        } else {
            None
        }
    }

    /// Project this chat into the summary shown to `viewer`.
    pub fn summary_for(&self, viewer: &UserId, name: String, is_online: bool) -> Option<ChatSummary> {
        let counterpart = self.counterpart(viewer)?;
        Some(ChatSummary {
            chat_id: self.id.clone(),
            receiver: counterpart.clone(),
            name,
            last_message: self.last_message.clone(),
            is_blocked: self.is_blocked,
            last_updated: self.last_updated,
            is_online,
        })
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message accepted by the relay, before the store has recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: String,
    pub attachments: Vec<String>,
}

/// A persisted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: String,
    pub attachments: Vec<String>,
    pub status: MessageStatus,
    /// Assigned at acceptance; strictly increasing within a chat.
    pub created_at: DateTime<Utc>,
    /// Submission order across the whole store.
    pub seq: i64,
}

impl StoredMessage {
    pub fn to_view(&self) -> MessageView {
        MessageView {
            id: self.id,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            status: self.status,
            message: self.body.clone(),
            attachments: self.attachments.clone(),
            created_at: self.created_at,
        }
    }
}
