//! Protocol-level errors.

use thiserror::Error;

/// A single frame could not be encoded or decoded.
///
/// These are per-message failures: the receiver drops the offending frame and
/// keeps the connection open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not a JSON envelope at all
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Envelope parsed but its `type` is not one we understand
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known `type` with a payload that does not match its schema
    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Outbound message could not be serialized
    #[error("Failed to encode message: {0}")]
    Encode(String),
}
