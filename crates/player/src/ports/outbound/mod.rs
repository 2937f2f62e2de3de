//! Outbound ports - Interfaces for external services
//!
//! These ports define the contracts that infrastructure adapters must implement,
//! allowing the connection manager and synchronizers to talk to sockets and REST
//! endpoints without depending on concrete implementations.

pub mod player_events;
pub mod snapshot_port;
pub mod transport_port;

pub use player_events::{CloseReason, EventKind, PlayerEvent};
pub use snapshot_port::{ApiError, SnapshotSource};
pub use transport_port::{
    FrameSink, FrameStream, TransportConnector, TransportError, TransportSession,
};

#[cfg(any(test, feature = "testing"))]
pub use snapshot_port::MockSnapshotSource;
