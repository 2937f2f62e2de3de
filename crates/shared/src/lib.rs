//! Launchpad Shared - wire types for the launcher's realtime connection
//!
//! This crate contains the types exchanged over the single realtime socket:
//! - `ClientMessage` (launcher → server) and `ServerMessage` (server → launcher)
//! - Payload structs for every message type
//! - `ProtocolError` for per-frame decode failures
//!
//! # Design Principles
//!
//! 1. **Minimal dependencies** - Only serde, serde_json, chrono, and thiserror
//! 2. **No business logic** - Pure data types and serialization

pub mod error;
pub mod messages;

pub use error::ProtocolError;
pub use messages::{
    AuthPayload, ChatDeletePayload, ChatEditPayload, ChatRefPayload, ChatSendPayload,
    ClientMessage, ErrorPayload, InboundChatMessage, MarkReadPayload, MessageDeletedPayload,
    MessageEditedPayload, PresenceEvent, PresenceUpdatePayload, ServerMessage, TypingPayload,
    AUTH_ERROR_CODES,
};
