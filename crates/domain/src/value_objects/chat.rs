//! Chat message value objects and optimistic-ack bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::{ChatId, MessageId, UserId};

/// Server acknowledgment state of a locally known message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckState {
    /// Applied locally, waiting for the server.
    Pending,
    /// Accepted by the server (or received from it).
    #[default]
    Confirmed,
    /// The server rejected it or never answered. Stays visible until the
    /// caller retries or discards it.
    Failed,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Tombstone marker. Deleted messages keep their id and slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ack_state: AckState,
}

impl ChatMessage {
    /// Build the local copy of a message that has not reached the server yet.
    pub fn optimistic(
        chat_id: ChatId,
        sender_id: UserId,
        sender_username: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::temporary(),
            chat_id,
            sender_id,
            sender_username: sender_username.into(),
            content: content.into(),
            created_at,
            edited_at: None,
            deleted_at: None,
            ack_state: AckState::Pending,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Content to render; `None` for tombstones.
    pub fn display_content(&self) -> Option<&str> {
        if self.is_deleted() {
            None
        } else {
            Some(&self.content)
        }
    }
}

/// Normalize user-entered message content.
///
/// Rejects empty and whitespace-only content and trims surrounding whitespace.
pub fn normalize_content(content: &str) -> Result<String, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("message content cannot be empty"));
    }
    Ok(trimmed.to_string())
}

/// Someone is typing in a conversation.
///
/// Always carries an expiry so the indicator disappears even if the matching
/// stop signal never arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TypingState {
    pub fn new(
        chat_id: ChatId,
        user_id: UserId,
        username: Option<String>,
        started_at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            chat_id,
            user_id,
            username,
            expires_at: started_at + window,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
