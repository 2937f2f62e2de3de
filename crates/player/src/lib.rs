//! Launchpad Player - realtime core of the game launcher.
//!
//! One authenticated socket per session, fanned out through an in-process
//! event bus to the presence, chat and admin-telemetry synchronizers.

pub mod application;
pub mod config;
pub mod infrastructure;
pub mod ports;
pub mod realtime;

pub use application::services::{AdminTelemetryRelay, ChatSynchronizer, PresenceTracker};
pub use application::{ChatError, SessionIdentity};
pub use config::{ConfigError, RealtimeConfig};
pub use infrastructure::messaging::{ConnectionError, ConnectionState, EventBus};
pub use infrastructure::websocket::ConnectionManager;
pub use ports::outbound::{EventKind, PlayerEvent};
pub use realtime::RealtimeCore;
