//! Snapshot Port - REST collaborators that seed realtime state
//!
//! History and snapshot endpoints are owned elsewhere; the synchronizers only
//! pull from them on startup and after a reconnect.

use async_trait::async_trait;
use thiserror::Error;

use launchpad_domain::{ActivityLogEntry, ChatId, ChatMessage, DashboardStats, PresenceEntry};

/// Errors from REST snapshot fetches
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request never got a response
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Session token was rejected
    #[error("Unauthorized")]
    Unauthorized,

    /// Non-success status
    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// Body did not match the expected shape
    #[error("Invalid response body: {0}")]
    Decode(String),
}

/// Read-only REST endpoints consumed by the realtime core.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Recent history of one conversation, any order.
    async fn chat_history(&self, chat_id: &ChatId) -> Result<Vec<ChatMessage>, ApiError>;

    /// Current presence of the session user's friends.
    async fn presence_snapshot(&self) -> Result<Vec<PresenceEntry>, ApiError>;

    /// Authoritative admin dashboard counters.
    async fn admin_stats(&self) -> Result<DashboardStats, ApiError>;

    /// Latest admin activity log entries, any order.
    async fn admin_logs(&self) -> Result<Vec<ActivityLogEntry>, ApiError>;
}
