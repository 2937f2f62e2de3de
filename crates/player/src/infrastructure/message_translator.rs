//! Translates ServerMessage from the wire protocol to PlayerEvent for the bus
//!
//! Keeps the synchronizers independent of protocol types beyond the payload
//! structs they already share with `launchpad-shared`.
//!
//! All ServerMessage variants are explicitly handled. Server `error` frames are
//! split in two: those naming one of our operations (a correlation id or temp id)
//! become `chat:rejected` so the owning synchronizer can roll back; everything
//! else is a plain `error` event.

use launchpad_shared::ServerMessage;

use crate::ports::outbound::player_events::PlayerEvent;

/// Translate a ServerMessage into a PlayerEvent
pub fn translate(msg: ServerMessage) -> PlayerEvent {
    match msg {
        // =====================================================================
        // Chat Events
        // =====================================================================
        ServerMessage::ChatMessage(payload) => PlayerEvent::ChatMessage(payload),
        ServerMessage::ChatMessageEdited(payload) => PlayerEvent::ChatMessageEdited(payload),
        ServerMessage::ChatMessageDeleted(payload) => PlayerEvent::ChatMessageDeleted(payload),
        ServerMessage::ChatTyping(payload) => PlayerEvent::ChatTyping(payload),

        // =====================================================================
        // Presence & Admin Events
        // =====================================================================
        ServerMessage::PresenceUpdate(payload) => PlayerEvent::PresenceUpdate(payload),
        ServerMessage::AdminStatsUpdated(patch) => PlayerEvent::AdminStatsUpdated(patch),
        ServerMessage::AdminUserAction(entry) => PlayerEvent::AdminUserAction(entry),

        // =====================================================================
        // Control
        // =====================================================================
        ServerMessage::Pong => PlayerEvent::Pong,

        ServerMessage::Error(payload)
            if payload.correlation_id.is_some() || payload.temp_id.is_some() =>
        {
            PlayerEvent::ChatRejected(payload)
        }
        ServerMessage::Error(payload) => PlayerEvent::ServerError(payload),
    }
}
