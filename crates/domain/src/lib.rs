//! Launchpad Domain - identifiers and value types shared by the realtime core.
//!
//! Pure data: no runtime, transport, or timer dependencies.

pub mod error;
pub mod ids;
pub mod value_objects;

pub use error::DomainError;
pub use ids::{ActivityId, ChatId, MessageId, UserId, TEMP_ID_PREFIX};
pub use value_objects::{
    normalize_content, AckState, ActivityLevel, ActivityLogEntry, ChatMessage, DashboardStats,
    DisplayStatus, PresenceEntry, PresenceStatus, StatsPatch, TypingState,
};
