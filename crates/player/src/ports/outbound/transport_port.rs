//! Transport Port - the raw socket underneath the realtime connection
//!
//! The connection manager only needs three things from a socket: open it,
//! write a text frame, and read the next text frame. Splitting the session into
//! a sink and a stream lets the session loop read and write concurrently.
//!
//! Implemented by:
//! - `TungsteniteConnector` (desktop, `tokio-tungstenite`)
//! - `MemoryConnector` (tests, in-process channels)

use async_trait::async_trait;
use thiserror::Error;

/// Socket-level failures. All of these are recoverable except `Unauthorized`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket could not be opened
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Handshake rejected the session credentials
    #[error("Handshake rejected as unauthorized")]
    Unauthorized,

    /// Peer closed the socket or the socket broke mid-read
    #[error("Socket closed: {0}")]
    Closed(String),

    /// A frame could not be written
    #[error("Send failed: {0}")]
    Send(String),
}

/// Write half of an open socket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Best-effort close; errors are not interesting at this point.
    async fn close(&mut self);
}

/// Read half of an open socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `None` once the socket is closed.
    ///
    /// Must be cancel-safe: the session loop drops this future whenever another
    /// branch of its `select!` wins.
    async fn next(&mut self) -> Option<Result<String, TransportError>>;
}

/// An open socket, split into halves.
pub struct TransportSession {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl TransportSession {
    pub fn new(sink: impl FrameSink + 'static, stream: impl FrameStream + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            stream: Box::new(stream),
        }
    }
}

/// Opens sockets. One call per connection attempt.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportSession, TransportError>;
}
