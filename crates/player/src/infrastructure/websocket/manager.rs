//! ConnectionManager - owns the single realtime socket of a session.
//!
//! One background task per connect cycle drives the socket:
//!
//! ```text
//! Disconnected/Closed --connect()--> Connecting --ok--> Connected
//!                                        |                 |  socket lost / pong timeout
//!                                        v fail            v
//!                                   Reconnecting <---------+
//!                                        | budget spent -> Disconnected (offline)
//!                                        | auth rejected -> Closed (session expired)
//! any --disconnect()--> Closed
//! ```
//!
//! Inbound frames are parsed, translated and published on the EventBus one at
//! a time by the session task. Outbound messages go through a per-session
//! `CommandBus`; they are only accepted while `Connected`.
//!
//! Lock discipline: the lifecycle mutex guards state transitions only. It is
//! never held across an `.await` or while publishing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use launchpad_shared::{AuthPayload, ClientMessage, ServerMessage};

use crate::config::ConnectionConfig;
use crate::infrastructure::message_translator::translate;
use crate::infrastructure::messaging::{
    BusMessage, CommandBus, ConnectionError, ConnectionSnapshot, ConnectionState,
    ConnectionStateObserver, EventBus,
};
use crate::ports::outbound::{
    CloseReason, FrameSink, PlayerEvent, TransportConnector, TransportError, TransportSession,
};

use super::core::BackoffState;

type Outcome = Option<Result<(), ConnectionError>>;

#[derive(Default)]
struct Lifecycle {
    /// Bumped whenever a cycle is started or abandoned; stale tasks compare
    /// against it before touching state.
    generation: u64,
    cancel: Option<CancellationToken>,
    /// Present only while `Connected`
    bus: Option<CommandBus>,
    /// Result of the most recent attempt of the running cycle
    outcome: Option<watch::Receiver<Outcome>>,
}

enum SessionEnd {
    Cancelled,
    AuthRejected(String),
    Lost(String),
}

enum FrameAction {
    Continue,
    Pong,
    AuthRejected(String),
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    events: EventBus,
    status: watch::Sender<ConnectionSnapshot>,
    lifecycle: Mutex<Lifecycle>,
}

/// Owns the connection lifecycle for one authenticated session.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn TransportConnector>,
        events: EventBus,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                events,
                status,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch(&self) -> ConnectionStateObserver {
        ConnectionStateObserver::new(self.inner.status.subscribe())
    }

    /// Open the connection and authenticate with `token`.
    ///
    /// Resolves with the outcome of the first attempt. On failure a retry is
    /// already scheduled. Concurrent calls share the attempt in flight (the
    /// later token is ignored), and calling it while connected is a no-op.
    pub async fn connect(&self, token: impl Into<String>) -> Result<(), ConnectionError> {
        let token = token.into();

        let (mut outcome, started) = {
            let mut lifecycle = self.inner.lifecycle();
            let state = self.inner.status.borrow().state;
            if state == ConnectionState::Connected {
                return Ok(());
            }
            if state.can_connect() {
                lifecycle.generation += 1;
                let cancel = CancellationToken::new();
                let (tx, rx) = watch::channel(None);
                lifecycle.cancel = Some(cancel.clone());
                lifecycle.outcome = Some(rx.clone());
                lifecycle.bus = None;

                let snapshot = ConnectionSnapshot {
                    state: ConnectionState::Connecting,
                    ..Default::default()
                };
                self.inner.status.send_replace(snapshot.clone());
                (rx, Some((lifecycle.generation, cancel, tx, snapshot)))
            } else {
                // Join the attempt already in flight
                let Some(rx) = lifecycle.outcome.as_ref() else {
                    return Err(ConnectionError::NotConnected);
                };
                let mut rx = rx.clone();
                let _ = rx.borrow_and_update();
                (rx, None)
            }
        };

        if let Some((generation, cancel, tx, snapshot)) = started {
            tracing::info!(url = %self.inner.config.ws_url, "Connecting to realtime server");
            self.inner.events.publish(PlayerEvent::ConnectionStatus(snapshot));
            tokio::spawn(Arc::clone(&self.inner).run_cycle(generation, token, cancel, tx));
        }

        loop {
            if outcome.changed().await.is_err() {
                // Cycle ended without answering: abandoned by disconnect()
                return Err(ConnectionError::Cancelled);
            }
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
        }
    }

    /// Close the connection for good (logout).
    ///
    /// Cancels any reconnect in progress and publishes `connection:closed`.
    /// Calling it again is a no-op.
    pub fn disconnect(&self) {
        let snapshot = {
            let mut lifecycle = self.inner.lifecycle();
            let state = self.inner.status.borrow().state;
            if state == ConnectionState::Closed {
                return;
            }
            lifecycle.generation += 1;
            if let Some(cancel) = lifecycle.cancel.take() {
                cancel.cancel();
            }
            lifecycle.bus = None;
            lifecycle.outcome = None;

            let snapshot = ConnectionSnapshot {
                state: ConnectionState::Closed,
                ..Default::default()
            };
            self.inner.status.send_replace(snapshot.clone());
            snapshot
        };

        tracing::info!("Realtime connection closed");
        self.inner.events.publish(PlayerEvent::ConnectionStatus(snapshot));
        self.inner.events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::Logout,
        });
    }

    /// Send one message, resolving once the frame has been written.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        let bus = {
            let lifecycle = self.inner.lifecycle();
            if self.inner.status.borrow().state == ConnectionState::Connected {
                lifecycle.bus.clone()
            } else {
                None
            }
        };
        match bus {
            Some(bus) => bus.send(message).await,
            None => Err(ConnectionError::NotConnected),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.inner.lifecycle().cancel.take() {
            cancel.cancel();
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a state change on behalf of cycle `generation`.
    ///
    /// Returns the new snapshot, or `None` if that cycle has been abandoned.
    fn transition(
        &self,
        generation: u64,
        update: impl FnOnce(&mut Lifecycle, &mut ConnectionSnapshot),
    ) -> Option<ConnectionSnapshot> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.generation != generation {
            return None;
        }
        let mut snapshot = self.status.borrow().clone();
        update(&mut lifecycle, &mut snapshot);
        self.status.send_replace(snapshot.clone());
        Some(snapshot)
    }

    async fn run_cycle(
        self: Arc<Self>,
        generation: u64,
        token: String,
        cancel: CancellationToken,
        outcome: watch::Sender<Outcome>,
    ) {
        let mut backoff = BackoffState::new(self.config.reconnect_policy());
        let mut resumed = false;
        let mut last_error: Option<String> = None;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.open_session(&token) => result,
            };

            match attempt {
                Ok(session) => {
                    let (bus, commands) = CommandBus::channel(self.config.outbound_buffer);
                    let Some(snapshot) = self.transition(generation, |lifecycle, snapshot| {
                        lifecycle.bus = Some(bus);
                        *snapshot = ConnectionSnapshot {
                            state: ConnectionState::Connected,
                            ..Default::default()
                        };
                    }) else {
                        return;
                    };
                    outcome.send_replace(Some(Ok(())));
                    backoff.reset();

                    tracing::info!(resumed, "Realtime connection established");
                    self.events.publish(PlayerEvent::ConnectionStatus(snapshot));
                    self.events.publish(PlayerEvent::ConnectionOpen { resumed });
                    if resumed {
                        self.events.publish(PlayerEvent::ConnectionResync);
                    }

                    match self.run_session(session, commands, &cancel).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::AuthRejected(reason) => {
                            self.fail_auth(generation, reason);
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, "Realtime connection lost");
                            resumed = true;
                            last_error = Some(reason);
                        }
                    }
                }
                Err(ConnectionError::AuthRejected(reason)) => {
                    outcome.send_replace(Some(Err(ConnectionError::AuthRejected(reason.clone()))));
                    self.fail_auth(generation, reason);
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        attempt = backoff.attempts(),
                        "Realtime connection attempt failed"
                    );
                    last_error = Some(error.to_string());
                    outcome.send_replace(Some(Err(error)));
                }
            }

            let Some(delay) = backoff.next_delay_and_advance() else {
                self.go_offline(generation, backoff.attempts(), last_error);
                return;
            };

            let attempt = backoff.attempts();
            let error = last_error.clone();
            let Some(snapshot) = self.transition(generation, |lifecycle, snapshot| {
                lifecycle.bus = None;
                snapshot.state = ConnectionState::Reconnecting;
                snapshot.attempt = attempt;
                snapshot.last_error = error;
            }) else {
                return;
            };
            tracing::info!(
                attempt,
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.events.publish(PlayerEvent::ConnectionStatus(snapshot));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open the socket and send the `auth` frame.
    async fn open_session(&self, token: &str) -> Result<TransportSession, ConnectionError> {
        let mut session = self
            .connector
            .connect(&self.config.ws_url)
            .await
            .map_err(|e| match e {
                TransportError::Unauthorized => {
                    ConnectionError::AuthRejected("handshake rejected".to_string())
                }
                other => ConnectionError::Transport(other),
            })?;

        let auth = ClientMessage::Auth(AuthPayload {
            token: token.to_string(),
        });
        write_frame(session.sink.as_mut(), &auth).await?;
        Ok(session)
    }

    async fn run_session(
        &self,
        session: TransportSession,
        mut commands: mpsc::Receiver<BusMessage>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let TransportSession {
            mut sink,
            mut stream,
        } = session;

        let interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let pong_timeout = Duration::from_millis(self.config.pong_timeout_ms);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break SessionEnd::Cancelled,

                frame = stream.next() => match frame {
                    Some(Ok(text)) => match self.handle_frame(&text) {
                        FrameAction::Continue => {}
                        FrameAction::Pong => pong_deadline = None,
                        FrameAction::AuthRejected(reason) => break SessionEnd::AuthRejected(reason),
                    },
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("socket closed by peer".to_string()),
                },

                Some(BusMessage::Send { message, ack }) = commands.recv() => {
                    let result = write_frame(sink.as_mut(), &message).await;
                    let broken = match &result {
                        Err(ConnectionError::Transport(e)) => Some(e.to_string()),
                        _ => None,
                    };
                    let _ = ack.send(result);
                    if let Some(reason) = broken {
                        break SessionEnd::Lost(reason);
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = write_frame(sink.as_mut(), &ClientMessage::Ping).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + pong_timeout);
                    }
                }

                _ = sleep_until(pong_deadline) => {
                    break SessionEnd::Lost("heartbeat timed out".to_string());
                }
            }
        };

        sink.close().await;
        end
    }

    fn handle_frame(&self, text: &str) -> FrameAction {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding inbound frame");
                return FrameAction::Continue;
            }
        };

        if let ServerMessage::Error(payload) = &message {
            if payload.is_auth_failure() {
                let reason = if payload.message.is_empty() {
                    payload.code.clone()
                } else {
                    payload.message.clone()
                };
                return FrameAction::AuthRejected(reason);
            }
        }

        let action = if matches!(message, ServerMessage::Pong) {
            FrameAction::Pong
        } else {
            FrameAction::Continue
        };
        tracing::trace!(kind = message.kind(), "Inbound message");
        self.events.publish(translate(message));
        action
    }

    fn fail_auth(&self, generation: u64, reason: String) {
        let error = reason.clone();
        let Some(snapshot) = self.transition(generation, |lifecycle, snapshot| {
            if let Some(cancel) = lifecycle.cancel.take() {
                cancel.cancel();
            }
            lifecycle.bus = None;
            lifecycle.outcome = None;
            *snapshot = ConnectionSnapshot {
                state: ConnectionState::Closed,
                last_error: Some(error),
                ..Default::default()
            };
        }) else {
            return;
        };

        tracing::warn!(reason = %reason, "Session rejected; reconnection halted");
        self.events.publish(PlayerEvent::ConnectionStatus(snapshot));
        self.events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::AuthRejected,
        });
        self.events.publish(PlayerEvent::SessionExpired { reason });
    }

    fn go_offline(&self, generation: u64, attempts: u32, last_error: Option<String>) {
        let Some(snapshot) = self.transition(generation, |lifecycle, snapshot| {
            lifecycle.cancel = None;
            lifecycle.bus = None;
            lifecycle.outcome = None;
            *snapshot = ConnectionSnapshot {
                state: ConnectionState::Disconnected,
                offline: true,
                attempt: attempts,
                last_error,
            };
        }) else {
            return;
        };

        tracing::error!(attempts, "Reconnect budget exhausted; realtime is offline");
        self.events.publish(PlayerEvent::ConnectionStatus(snapshot));
        self.events.publish(PlayerEvent::ConnectionOffline { attempts });
    }
}

async fn write_frame(sink: &mut dyn FrameSink, message: &ClientMessage) -> Result<(), ConnectionError> {
    let text = message.to_json()?;
    sink.send(text).await?;
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
