pub mod http_client;
pub mod message_translator;
pub mod messaging;
pub mod websocket;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export messaging types
pub use messaging::{CommandBus, ConnectionState, EventBus};
