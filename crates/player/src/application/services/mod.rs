//! Application services
//!
//! The three synchronizers that turn raw realtime events into view state.
//! Each depends on the event bus and port traits only; none knows about the
//! others.

pub mod chat_service;
pub mod presence_service;
pub mod telemetry_service;

pub use chat_service::ChatSynchronizer;
pub use presence_service::PresenceTracker;
pub use telemetry_service::{ActivityFeed, AdminTelemetryRelay};
