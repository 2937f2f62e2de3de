//! Connection lifecycle types.
//!
//! The connection manager owns the only writer of [`ConnectionSnapshot`]; everyone
//! else observes it through a [`ConnectionStateObserver`] or the
//! `connection:status` event.

use thiserror::Error;
use tokio::sync::watch;

use launchpad_shared::ProtocolError;

use crate::ports::outbound::TransportError;

/// Connection state for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Disconnected,
    /// Attempting to establish the first connection
    Connecting,
    /// Socket open and authenticated
    Connected,
    /// Connection lost, retrying with backoff
    Reconnecting,
    /// Logged out or credentials rejected; `connect()` starts over
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether `connect()` may start a fresh attempt from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything dependents need to render connection status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Retry budget exhausted; stays set until the next `connect()`
    pub offline: bool,
    /// Current reconnect attempt, 0 when not reconnecting
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Observable connection state for UI binding.
///
/// Cheap to clone; every clone sees the latest snapshot.
#[derive(Clone)]
pub struct ConnectionStateObserver {
    rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionStateObserver {
    pub fn new(rx: watch::Receiver<ConnectionSnapshot>) -> Self {
        Self { rx }
    }

    pub fn state(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.rx.borrow().is_connected()
    }

    /// Wait for the next snapshot change.
    ///
    /// Returns `None` once the connection manager is gone.
    pub async fn changed(&mut self) -> Option<ConnectionSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the snapshot satisfies `predicate`, checking the current one
    /// first.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> Option<ConnectionSnapshot> {
        self.rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }
}

/// Errors surfaced to callers of the connection manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Outbound operations are only accepted while connected
    #[error("Not connected")]
    NotConnected,

    /// The attempt was abandoned because of `disconnect()`
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// Session credentials rejected; no further retries
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
