//! WebSocket message types for client-server communication
//!
//! Every frame is a JSON envelope `{"type": "...", "payload": {...}}`. Payload
//! field names are camelCase and timestamps are RFC 3339.
//!
//! ## Versioning Policy
//!
//! - New variants can be added at the end (forward compatible)
//! - Renaming a `type` string is a breaking change
//! - Unknown inbound `type` strings are reported as [`ProtocolError::UnknownType`]
//!   so the receiver can drop the single frame and keep the connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use launchpad_domain::{
    ActivityLogEntry, ChatId, ChatMessage, MessageId, PresenceStatus, StatsPatch, UserId,
};

use crate::error::ProtocolError;

// =============================================================================
// Client Messages (Launcher → Server)
// =============================================================================

/// Messages from the client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// First frame on every new socket
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "chat:send")]
    ChatSend(ChatSendPayload),
    #[serde(rename = "chat:edit")]
    ChatEdit(ChatEditPayload),
    #[serde(rename = "chat:delete")]
    ChatDelete(ChatDeletePayload),
    #[serde(rename = "chat:typing_start")]
    ChatTypingStart(ChatRefPayload),
    #[serde(rename = "chat:typing_stop")]
    ChatTypingStop(ChatRefPayload),
    #[serde(rename = "chat:mark_read")]
    ChatMarkRead(MarkReadPayload),
    /// Heartbeat ping
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendPayload {
    pub chat_id: ChatId,
    /// Client correlation id echoed back on the confirming `chat:message`
    pub temp_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEditPayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub content: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeletePayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRefPayload {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadPayload {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<MessageId>,
}

impl ClientMessage {
    /// Wire name of this message's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth(_) => "auth",
            ClientMessage::ChatSend(_) => "chat:send",
            ClientMessage::ChatEdit(_) => "chat:edit",
            ClientMessage::ChatDelete(_) => "chat:delete",
            ClientMessage::ChatTypingStart(_) => "chat:typing_start",
            ClientMessage::ChatTypingStop(_) => "chat:typing_stop",
            ClientMessage::ChatMarkRead(_) => "chat:mark_read",
            ClientMessage::Ping => "ping",
        }
    }

    /// Serialize into a text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

// =============================================================================
// Server Messages (Server → Launcher)
// =============================================================================

/// Messages from the server to the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// New message in a chat. Carries `temp_id` when it confirms one of our sends.
    ChatMessage(InboundChatMessage),
    ChatMessageEdited(MessageEditedPayload),
    ChatMessageDeleted(MessageDeletedPayload),
    /// Remote participant started or stopped typing
    ChatTyping(TypingPayload),
    PresenceUpdate(PresenceUpdatePayload),
    AdminStatsUpdated(StatsPatch),
    AdminUserAction(ActivityLogEntry),
    Pong,
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundChatMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEditedPayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub content: String,
    pub edited_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub is_typing: bool,
}

/// Kind of presence transition pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    UserOnline,
    UserOffline,
    UserPlaying,
}

impl PresenceEvent {
    pub fn status(self) -> PresenceStatus {
        match self {
            PresenceEvent::UserOnline => PresenceStatus::Online,
            PresenceEvent::UserOffline => PresenceStatus::Offline,
            PresenceEvent::UserPlaying => PresenceStatus::Playing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub event: PresenceEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// Error codes the server uses to reject the session itself.
pub const AUTH_ERROR_CODES: &[&str] = &["unauthorized", "auth_failed", "token_expired"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Correlation id of the rejected edit/delete, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Temp id of the rejected send, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

impl ErrorPayload {
    pub fn is_auth_failure(&self) -> bool {
        AUTH_ERROR_CODES.contains(&self.code.as_str())
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl ServerMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = raw.kind.as_str();

        Ok(match kind {
            "chat:message" => ServerMessage::ChatMessage(payload(kind, raw.payload)?),
            "chat:message_edited" => ServerMessage::ChatMessageEdited(payload(kind, raw.payload)?),
            "chat:message_deleted" => {
                ServerMessage::ChatMessageDeleted(payload(kind, raw.payload)?)
            }
            "chat:typing" => ServerMessage::ChatTyping(payload(kind, raw.payload)?),
            "presence:update" => ServerMessage::PresenceUpdate(payload(kind, raw.payload)?),
            "admin:stats_updated" => ServerMessage::AdminStatsUpdated(payload(kind, raw.payload)?),
            "admin:user_action" => ServerMessage::AdminUserAction(payload(kind, raw.payload)?),
            "pong" => ServerMessage::Pong,
            "error" => ServerMessage::Error(payload(kind, raw.payload)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }

    /// Wire name of this message's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ChatMessage(_) => "chat:message",
            ServerMessage::ChatMessageEdited(_) => "chat:message_edited",
            ServerMessage::ChatMessageDeleted(_) => "chat:message_deleted",
            ServerMessage::ChatTyping(_) => "chat:typing",
            ServerMessage::PresenceUpdate(_) => "presence:update",
            ServerMessage::AdminStatsUpdated(_) => "admin:stats_updated",
            ServerMessage::AdminUserAction(_) => "admin:user_action",
            ServerMessage::Pong => "pong",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launchpad_domain::AckState;

    #[test]
    fn client_message_uses_type_payload_envelope() {
        let msg = ClientMessage::ChatSend(ChatSendPayload {
            chat_id: ChatId::from("chat1"),
            temp_id: MessageId::from("tmp-1"),
            content: "hi".into(),
        });
        let json: serde_json::Value =
            serde_json::from_str(&msg.to_json().expect("encode")).expect("json");

        assert_eq!(json["type"], "chat:send");
        assert_eq!(json["payload"]["chatId"], "chat1");
        assert_eq!(json["payload"]["tempId"], "tmp-1");
        assert_eq!(json["payload"]["content"], "hi");
    }

    #[test]
    fn ping_has_no_payload() {
        let json = ClientMessage::Ping.to_json().expect("encode");
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn parses_confirming_chat_message() {
        let text = r#"{"type":"chat:message","payload":{
            "id":"srv-42","chatId":"chat1","senderId":"me","senderUsername":"me",
            "content":"hi","createdAt":"2024-05-01T10:00:00Z","tempId":"tmp-abc"}}"#;

        let ServerMessage::ChatMessage(inbound) = ServerMessage::parse(text).expect("parse")
        else {
            panic!("expected chat message");
        };
        assert_eq!(inbound.message.id.as_str(), "srv-42");
        assert_eq!(inbound.temp_id, Some(MessageId::from("tmp-abc")));
        assert_eq!(inbound.message.ack_state, AckState::Confirmed);
    }

    #[test]
    fn parses_presence_update() {
        let text = r#"{"type":"presence:update","payload":{
            "userId":"u2","username":"bob","event":"user_playing","serverName":"EU-1"}}"#;

        let ServerMessage::PresenceUpdate(update) = ServerMessage::parse(text).expect("parse")
        else {
            panic!("expected presence update");
        };
        assert_eq!(update.event.status(), PresenceStatus::Playing);
        assert_eq!(update.server_name.as_deref(), Some("EU-1"));
    }

    #[test]
    fn pong_without_payload_parses() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"pong"}"#).expect("parse"),
            ServerMessage::Pong
        );
    }

    #[test]
    fn unknown_type_is_reported_not_panicked() {
        let err = ServerMessage::parse(r#"{"type":"store:sale","payload":{}}"#)
            .expect_err("unknown type");
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "store:sale"));
    }

    #[test]
    fn malformed_json_and_bad_payload_are_distinct() {
        assert!(matches!(
            ServerMessage::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"presence:update","payload":{"userId":"u1"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn auth_error_codes_are_recognized() {
        let err = ErrorPayload {
            code: "unauthorized".into(),
            message: "bad token".into(),
            correlation_id: None,
            temp_id: None,
        };
        assert!(err.is_auth_failure());

        let err = ErrorPayload {
            code: "edit_rejected".into(),
            ..err
        };
        assert!(!err.is_auth_failure());
    }
}
