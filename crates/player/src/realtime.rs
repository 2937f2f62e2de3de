//! RealtimeCore - composition root for one logged-in launcher session
//!
//! Builds the event bus, the connection manager, and the three synchronizers
//! around it. Everything is owned here and handed out by reference; there is no
//! global state.

use std::sync::Arc;

use crate::application::services::{AdminTelemetryRelay, ChatSynchronizer, PresenceTracker};
use crate::application::SessionIdentity;
use crate::config::RealtimeConfig;
use crate::infrastructure::messaging::{ConnectionError, ConnectionStateObserver, EventBus};
use crate::infrastructure::websocket::ConnectionManager;
use crate::ports::outbound::{SnapshotSource, TransportConnector};

pub struct RealtimeCore {
    // Synchronizers drop (and unsubscribe) before the connection they listen to
    presence: PresenceTracker,
    chat: ChatSynchronizer,
    telemetry: AdminTelemetryRelay,
    connection: Arc<ConnectionManager>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    events: EventBus,
}

impl RealtimeCore {
    pub fn new(
        config: RealtimeConfig,
        identity: SessionIdentity,
        connector: Arc<dyn TransportConnector>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
    ) -> Self {
        let events = EventBus::new();
        let connection = Arc::new(ConnectionManager::new(
            config.connection,
            connector,
            events.clone(),
        ));

        let presence = PresenceTracker::new(events.clone(), snapshots.clone());
        let chat = ChatSynchronizer::new(
            identity,
            config.chat,
            Arc::clone(&connection),
            snapshots.clone(),
        );
        let telemetry = AdminTelemetryRelay::new(config.telemetry, events.clone(), snapshots.clone());

        Self {
            presence,
            chat,
            telemetry,
            connection,
            snapshots,
            events,
        }
    }

    /// Connect and seed presence and admin state from their REST snapshots.
    ///
    /// Snapshot failures are logged; only the connection result is returned.
    pub async fn start(&self, token: impl Into<String>) -> Result<(), ConnectionError> {
        self.connection.connect(token).await?;

        let Some(snapshots) = &self.snapshots else {
            return Ok(());
        };
        match snapshots.presence_snapshot().await {
            Ok(entries) => self.presence.seed(entries),
            Err(e) => tracing::warn!(error = %e, "Could not load presence snapshot"),
        }
        if let Err(e) = self.telemetry.refresh().await {
            tracing::warn!(error = %e, "Could not load admin snapshots");
        }
        Ok(())
    }

    /// Log out: close the socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.connection.disconnect();
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn watch_connection(&self) -> ConnectionStateObserver {
        self.connection.watch()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn chat(&self) -> &ChatSynchronizer {
        &self.chat
    }

    pub fn telemetry(&self) -> &AdminTelemetryRelay {
        &self.telemetry
    }
}
