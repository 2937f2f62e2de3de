//! In-memory transport and shared test fixtures.
//!
//! `MemoryConnector` stands in for the socket: every accepted connection is
//! handed to the test as a [`MemoryServer`] that can read what the client wrote
//! and push frames back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use launchpad_domain::{ChatId, ChatMessage, MessageId, UserId};
use launchpad_shared::ClientMessage;

use crate::ports::outbound::{
    ApiError, FrameSink, FrameStream, TransportConnector, TransportError, TransportSession,
};

pub fn api_request_failed(msg: &str) -> ApiError {
    ApiError::RequestFailed(msg.to_string())
}

/// Fixed timestamp `seconds` after a reference instant.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .unwrap_or_default()
}

/// A confirmed message as the server would send it.
pub fn server_message(id: &str, chat: &str, sender: &str, content: &str, seconds: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        chat_id: ChatId::from(chat),
        sender_id: UserId::from(sender),
        sender_username: sender.to_string(),
        content: content.to_string(),
        created_at: at(seconds),
        edited_at: None,
        deleted_at: None,
        ack_state: Default::default(),
    }
}

/// What the next `connect` call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPlan {
    Accept,
    Refuse,
    Unauthorized,
}

/// Test transport. Accepts every connection unless a plan says otherwise.
pub struct MemoryConnector {
    plans: Mutex<VecDeque<ConnectPlan>>,
    attempts: AtomicU32,
    auto_pong: bool,
    servers: mpsc::UnboundedSender<MemoryServer>,
}

/// Receives one [`MemoryServer`] per accepted connection.
pub struct MemoryServers {
    rx: mpsc::UnboundedReceiver<MemoryServer>,
}

impl MemoryServers {
    pub async fn next(&mut self) -> Option<MemoryServer> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<MemoryServer> {
        self.rx.try_recv().ok()
    }
}

impl MemoryConnector {
    /// Connector whose sockets answer every `ping` with a `pong`.
    pub fn new() -> (Arc<Self>, MemoryServers) {
        Self::build(true)
    }

    /// Connector whose sockets never answer pings.
    pub fn silent() -> (Arc<Self>, MemoryServers) {
        Self::build(false)
    }

    fn build(auto_pong: bool) -> (Arc<Self>, MemoryServers) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
            auto_pong,
            servers,
        });
        (connector, MemoryServers { rx })
    }

    /// Queue behaviour for upcoming connection attempts, in order.
    pub fn plan(&self, plans: impl IntoIterator<Item = ConnectPlan>) {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(plans);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<TransportSession, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(ConnectPlan::Accept);

        match plan {
            ConnectPlan::Refuse => Err(TransportError::Connect("connection refused".into())),
            ConnectPlan::Unauthorized => Err(TransportError::Unauthorized),
            ConnectPlan::Accept => {
                let (client_tx, from_client) = mpsc::unbounded_channel();
                let (to_client, client_rx) = mpsc::unbounded_channel();
                let sink = MemorySink {
                    tx: client_tx,
                    pong: self.auto_pong.then(|| to_client.downgrade()),
                };
                let stream = MemoryStream { rx: client_rx };
                let server = MemoryServer {
                    from_client,
                    to_client: Some(to_client),
                };
                self.servers
                    .send(server)
                    .map_err(|_| TransportError::Connect("test dropped the server handle".into()))?;
                Ok(TransportSession::new(sink, stream))
            }
        }
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
    pong: Option<mpsc::WeakUnboundedSender<Result<String, TransportError>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let is_ping = text == r#"{"type":"ping"}"#;
        self.tx
            .send(text)
            .map_err(|_| TransportError::Send("server side closed".into()))?;

        if is_ping {
            if let Some(to_client) = self.pong.as_ref().and_then(|weak| weak.upgrade()) {
                let _ = to_client.send(Ok(r#"{"type":"pong"}"#.to_string()));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

/// Server side of one in-memory connection.
pub struct MemoryServer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl MemoryServer {
    /// Next client message, skipping heartbeat pings.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            let message = self.recv_any().await?;
            if message != ClientMessage::Ping {
                return Some(message);
            }
        }
    }

    /// Next client message, pings included.
    pub async fn recv_any(&mut self) -> Option<ClientMessage> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Push a `{type, payload}` frame to the client.
    pub fn push(&self, kind: &str, payload: Value) {
        self.push_raw(&serde_json::json!({ "type": kind, "payload": payload }).to_string());
    }

    pub fn push_raw(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(text.to_string()));
        }
    }

    /// Close the socket from the server side.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }
}
