//! Messaging infrastructure: the event bus, the outbound command path, and the
//! connection lifecycle types shared by both.

mod command_bus;
mod connection;
mod event_bus;

pub use command_bus::{BusMessage, CommandBus};
pub use connection::{
    ConnectionError, ConnectionSnapshot, ConnectionState, ConnectionStateObserver,
};
pub use event_bus::{DispatchReport, EventBus, Subscription, SubscriptionHandle};
