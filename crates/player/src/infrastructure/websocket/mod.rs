//! WebSocket connection to the realtime server
//!
//! - `core`: reconnect policy and backoff math, runtime-free
//! - `manager`: the connection lifecycle state machine
//! - `desktop`: tokio-tungstenite transport

pub mod core;
mod desktop;
mod manager;

pub use self::core::{BackoffState, ReconnectPolicy};
pub use desktop::TungsteniteConnector;
pub use manager::ConnectionManager;
