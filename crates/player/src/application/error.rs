//! Application-level errors
//!
//! These only ever describe one caller's operation; a rejected chat operation
//! never affects the connection or other conversations.

use thiserror::Error;

use launchpad_domain::MessageId;

use crate::infrastructure::messaging::ConnectionError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Content was empty or whitespace only
    #[error("Message content cannot be empty")]
    EmptyContent,

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Edits and deletes need the server id; wait for the send to be confirmed
    #[error("Message {0} is not confirmed yet")]
    NotConfirmed(MessageId),

    #[error("Message {0} has been deleted")]
    Deleted(MessageId),

    /// Retry and discard only apply to failed sends
    #[error("Message {0} has not failed")]
    NotFailed(MessageId),

    /// The optimistic change was applied but could not be delivered; it has
    /// been marked failed (send) or reverted (edit, delete)
    #[error("Could not deliver {message_id}: {source}")]
    Delivery {
        message_id: MessageId,
        #[source]
        source: ConnectionError,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
