//! Value objects - plain data defined by their attributes

mod chat;
mod presence;
mod telemetry;

pub use chat::{normalize_content, AckState, ChatMessage, TypingState};
pub use presence::{DisplayStatus, PresenceEntry, PresenceStatus};
pub use telemetry::{ActivityLevel, ActivityLogEntry, DashboardStats, StatsPatch};
