//! Desktop WebSocket transport using tokio-tungstenite

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::ports::outbound::{
    FrameSink, FrameStream, TransportConnector, TransportError, TransportSession,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` / `wss://` sockets with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<TransportSession, TransportError> {
        match connect_async(url).await {
            Ok((socket, _response)) => {
                tracing::debug!(url = %url, "WebSocket handshake complete");
                let (write, read) = socket.split();
                Ok(TransportSession::new(
                    WsSink { write },
                    WsStream { read },
                ))
            }
            Err(tungstenite::Error::Http(response))
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                Err(TransportError::Unauthorized)
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

struct WsSink {
    write: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

struct WsStream {
    read: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::info!(frame = ?frame, "Server closed connection");
                    return None;
                }
                // Control frames are answered by tungstenite; binary is not part of the protocol
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Closed(e.to_string()))),
            }
        }
    }
}
