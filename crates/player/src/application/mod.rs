//! Application layer: the stateful synchronizers built on the event bus.
//!
//! Each synchronizer subscribes to the events it cares about, keeps its own
//! derived state, and announces changes with a `*:changed`/`*:updated` event.
//! They never talk to each other or to the transport directly.

pub mod error;
pub mod services;

use launchpad_domain::UserId;

pub use error::ChatError;

/// Who is logged in on this launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub username: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}
