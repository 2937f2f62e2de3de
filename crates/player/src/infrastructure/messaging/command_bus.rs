//! Command Bus for handing outbound messages to the session task.
//!
//! The CommandBus is the only path from callers to the socket writer. Each send
//! carries a oneshot that the session task resolves once the frame has been
//! written (or failed), so callers learn the outcome instead of losing it.

use tokio::sync::{mpsc, oneshot};

use launchpad_shared::ClientMessage;

use super::connection::ConnectionError;

/// Message types sent through the command bus to the session task.
#[derive(Debug)]
pub enum BusMessage {
    Send {
        message: ClientMessage,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
}

/// Sender half bound to one live session.
///
/// A fresh bus is created for every successful connect; once that session ends
/// its receiver is dropped and every send fails with `NotConnected`.
#[derive(Clone, Debug)]
pub struct CommandBus {
    tx: mpsc::Sender<BusMessage>,
}

impl CommandBus {
    pub fn new(tx: mpsc::Sender<BusMessage>) -> Self {
        Self { tx }
    }

    /// Create a bus together with the receiver the session task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Queue a message and wait until the session task has written it.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(BusMessage::Send { message, ack })
            .await
            .map_err(|_| ConnectionError::NotConnected)?;

        // Dropped without an answer means the session ended mid-write
        ack_rx.await.unwrap_or(Err(ConnectionError::NotConnected))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
