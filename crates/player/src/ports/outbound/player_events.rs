//! Player events - everything that travels over the EventBus
//!
//! Two families share one enum:
//! - inbound server events, translated from `ServerMessage` by the message
//!   translator (`chat:message`, `presence:update`, ...)
//! - local events published by the connection manager and the synchronizers
//!   (`connection:open`, `chat:updated`, ...)
//!
//! Subscriptions are keyed by [`EventKind`], whose string names are stable and
//! match the wire `type` where one exists.

use std::fmt;

use launchpad_domain::{ActivityLogEntry, ChatId, StatsPatch, UserId};
use launchpad_shared::{
    ErrorPayload, InboundChatMessage, MessageDeletedPayload, MessageEditedPayload,
    PresenceUpdatePayload, TypingPayload,
};

use crate::infrastructure::messaging::ConnectionSnapshot;

/// Why the connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `disconnect()` / logout
    Logout,
    /// Server rejected the session credentials
    AuthRejected,
}

/// Subscription key for the EventBus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionOpen,
    ConnectionClosed,
    ConnectionStatus,
    ConnectionResync,
    ConnectionOffline,
    SessionExpired,
    ChatMessage,
    ChatMessageEdited,
    ChatMessageDeleted,
    ChatTyping,
    ChatRejected,
    ChatUpdated,
    PresenceUpdate,
    PresenceChanged,
    AdminStatsUpdated,
    AdminUserAction,
    AdminUpdated,
    Pong,
    ServerError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ConnectionOpen => "connection:open",
            EventKind::ConnectionClosed => "connection:closed",
            EventKind::ConnectionStatus => "connection:status",
            EventKind::ConnectionResync => "connection:resync",
            EventKind::ConnectionOffline => "connection:offline",
            EventKind::SessionExpired => "session:expired",
            EventKind::ChatMessage => "chat:message",
            EventKind::ChatMessageEdited => "chat:message_edited",
            EventKind::ChatMessageDeleted => "chat:message_deleted",
            EventKind::ChatTyping => "chat:typing",
            EventKind::ChatRejected => "chat:rejected",
            EventKind::ChatUpdated => "chat:updated",
            EventKind::PresenceUpdate => "presence:update",
            EventKind::PresenceChanged => "presence:changed",
            EventKind::AdminStatsUpdated => "admin:stats_updated",
            EventKind::AdminUserAction => "admin:user_action",
            EventKind::AdminUpdated => "admin:updated",
            EventKind::Pong => "pong",
            EventKind::ServerError => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered to EventBus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    // =========================================================================
    // Connection lifecycle (published by the ConnectionManager)
    // =========================================================================
    /// Socket is up and authenticated. `resumed` is true after a reconnect.
    ConnectionOpen { resumed: bool },
    ConnectionClosed { reason: CloseReason },
    /// Any change of the connection snapshot
    ConnectionStatus(ConnectionSnapshot),
    /// Reconnected; every synchronizer should reconcile against a fresh pull
    ConnectionResync,
    /// Retry budget exhausted; no further automatic attempts
    ConnectionOffline { attempts: u32 },
    /// Session credentials rejected; hand control back to login
    SessionExpired { reason: String },

    // =========================================================================
    // Inbound server events (translated from ServerMessage)
    // =========================================================================
    ChatMessage(InboundChatMessage),
    ChatMessageEdited(MessageEditedPayload),
    ChatMessageDeleted(MessageDeletedPayload),
    ChatTyping(TypingPayload),
    /// Server rejected one of our chat operations
    ChatRejected(ErrorPayload),
    PresenceUpdate(PresenceUpdatePayload),
    AdminStatsUpdated(StatsPatch),
    AdminUserAction(ActivityLogEntry),
    Pong,
    ServerError(ErrorPayload),

    // =========================================================================
    // Derived-state change notifications (published by the synchronizers)
    // =========================================================================
    ChatUpdated { chat_id: ChatId },
    /// `None` means every tracked user changed (e.g. degraded to unknown)
    PresenceChanged { user_id: Option<UserId> },
    AdminUpdated,
}

impl PlayerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlayerEvent::ConnectionOpen { .. } => EventKind::ConnectionOpen,
            PlayerEvent::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            PlayerEvent::ConnectionStatus(_) => EventKind::ConnectionStatus,
            PlayerEvent::ConnectionResync => EventKind::ConnectionResync,
            PlayerEvent::ConnectionOffline { .. } => EventKind::ConnectionOffline,
            PlayerEvent::SessionExpired { .. } => EventKind::SessionExpired,
            PlayerEvent::ChatMessage(_) => EventKind::ChatMessage,
            PlayerEvent::ChatMessageEdited(_) => EventKind::ChatMessageEdited,
            PlayerEvent::ChatMessageDeleted(_) => EventKind::ChatMessageDeleted,
            PlayerEvent::ChatTyping(_) => EventKind::ChatTyping,
            PlayerEvent::ChatRejected(_) => EventKind::ChatRejected,
            PlayerEvent::PresenceUpdate(_) => EventKind::PresenceUpdate,
            PlayerEvent::AdminStatsUpdated(_) => EventKind::AdminStatsUpdated,
            PlayerEvent::AdminUserAction(_) => EventKind::AdminUserAction,
            PlayerEvent::Pong => EventKind::Pong,
            PlayerEvent::ServerError(_) => EventKind::ServerError,
            PlayerEvent::ChatUpdated { .. } => EventKind::ChatUpdated,
            PlayerEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
            PlayerEvent::AdminUpdated => EventKind::AdminUpdated,
        }
    }
}
