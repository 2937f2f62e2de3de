//! ChatSynchronizer - optimistic chat kept consistent with the server
//!
//! Every local change (send, edit, delete) is applied immediately and recorded
//! in a pending-operations map keyed by its correlation id (the temp id for
//! sends). The matching server event resolves the entry; a rejection, a missed
//! ack window, or a closed connection fails it:
//! - failed send: the message stays visible with `AckState::Failed`
//! - failed edit: previous content restored
//! - failed delete: tombstone removed
//!
//! Timers and background refreshes only hold `Weak` references, so nothing
//! fires into a dropped synchronizer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use uuid::Uuid;

use launchpad_domain::{
    normalize_content, AckState, ChatId, ChatMessage, MessageId, TypingState, UserId,
};
use launchpad_shared::{
    ChatDeletePayload, ChatEditPayload, ChatRefPayload, ChatSendPayload, ClientMessage,
    ErrorPayload, InboundChatMessage, MarkReadPayload, MessageDeletedPayload,
    MessageEditedPayload, TypingPayload,
};

use crate::application::{ChatError, SessionIdentity};
use crate::config::ChatConfig;
use crate::infrastructure::messaging::{ConnectionError, EventBus, SubscriptionHandle};
use crate::infrastructure::websocket::ConnectionManager;
use crate::ports::outbound::{EventKind, PlayerEvent, SnapshotSource};

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    unread: u32,
    read_boundary: Option<MessageId>,
    /// Boundary not yet delivered to the server
    read_unsent: bool,
}

impl Conversation {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Oldest of our own optimistic sends (pending or failed) with this
    /// content. A server copy of it confirms that slot.
    fn unconfirmed_send(&self, sender: &UserId, content: &str) -> Option<MessageId> {
        self.messages
            .iter()
            .find(|m| {
                m.id.is_temporary()
                    && m.ack_state != AckState::Confirmed
                    && &m.sender_id == sender
                    && m.content == content
            })
            .map(|m| m.id.clone())
    }

    /// Insert and re-sort by timestamp. The sort is stable, so equal
    /// timestamps keep arrival order.
    fn insert_sorted(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.messages.sort_by_key(|m| m.created_at);
    }
}

#[derive(Debug)]
enum PendingOp {
    Send {
        chat_id: ChatId,
        temp_id: MessageId,
    },
    Edit {
        chat_id: ChatId,
        message_id: MessageId,
        previous: String,
        previous_edited_at: Option<DateTime<Utc>>,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
        previous_deleted_at: Option<DateTime<Utc>>,
    },
}

struct Pending {
    op: PendingOp,
    timer: Option<AbortHandle>,
}

struct Timer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct ChatState {
    chats: HashMap<ChatId, Conversation>,
    pending: HashMap<String, Pending>,
    remote_typing: HashMap<(ChatId, UserId), (TypingState, Timer)>,
    local_typing: HashMap<ChatId, Timer>,
    timer_generation: u64,
}

impl ChatState {
    fn locate(&self, id: &MessageId) -> Option<(ChatId, usize)> {
        self.chats
            .iter()
            .find_map(|(chat_id, conv)| conv.position(id).map(|i| (chat_id.clone(), i)))
    }

    fn message_mut(&mut self, chat_id: &ChatId, id: &MessageId) -> Option<&mut ChatMessage> {
        let conv = self.chats.get_mut(chat_id)?;
        let idx = conv.position(id)?;
        conv.messages.get_mut(idx)
    }

    fn next_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }

    /// Undo an optimistic change. Returns the affected chat.
    fn fail(&mut self, op: PendingOp) -> ChatId {
        match op {
            PendingOp::Send { chat_id, temp_id } => {
                if let Some(message) = self.message_mut(&chat_id, &temp_id) {
                    message.ack_state = AckState::Failed;
                }
                chat_id
            }
            PendingOp::Edit {
                chat_id,
                message_id,
                previous,
                previous_edited_at,
            } => {
                if let Some(message) = self.message_mut(&chat_id, &message_id) {
                    message.content = previous;
                    message.edited_at = previous_edited_at;
                }
                chat_id
            }
            PendingOp::Delete {
                chat_id,
                message_id,
                previous_deleted_at,
            } => {
                if let Some(message) = self.message_mut(&chat_id, &message_id) {
                    message.deleted_at = previous_deleted_at;
                }
                chat_id
            }
        }
    }

    fn resolve(&mut self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some(pending) => {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }
}

struct ChatInner {
    identity: SessionIdentity,
    config: ChatConfig,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    state: Mutex<ChatState>,
}

/// Per-conversation message lists, unread counts and typing indicators.
pub struct ChatSynchronizer {
    inner: Arc<ChatInner>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl ChatSynchronizer {
    pub fn new(
        identity: SessionIdentity,
        config: ChatConfig,
        connection: Arc<ConnectionManager>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
    ) -> Self {
        let events = connection.events().clone();
        let inner = Arc::new(ChatInner {
            identity,
            config,
            connection,
            events: events.clone(),
            snapshots,
            state: Mutex::new(ChatState::default()),
        });

        let mut subscriptions = Vec::new();
        let mut on = |kind: EventKind, handler: fn(&Arc<ChatInner>, &PlayerEvent)| {
            let weak = Arc::downgrade(&inner);
            subscriptions.push(events.subscribe(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    handler(&inner, event);
                }
            }));
        };

        on(EventKind::ChatMessage, |inner, event| {
            if let PlayerEvent::ChatMessage(payload) = event {
                inner.on_message(payload.clone());
            }
        });
        on(EventKind::ChatMessageEdited, |inner, event| {
            if let PlayerEvent::ChatMessageEdited(payload) = event {
                inner.on_edited(payload);
            }
        });
        on(EventKind::ChatMessageDeleted, |inner, event| {
            if let PlayerEvent::ChatMessageDeleted(payload) = event {
                inner.on_deleted(payload);
            }
        });
        on(EventKind::ChatTyping, |inner, event| {
            if let PlayerEvent::ChatTyping(payload) = event {
                inner.on_typing(payload);
            }
        });
        on(EventKind::ChatRejected, |inner, event| {
            if let PlayerEvent::ChatRejected(payload) = event {
                inner.on_rejected(payload);
            }
        });
        on(EventKind::ConnectionClosed, |inner, _| inner.on_closed());
        on(EventKind::ConnectionResync, |inner, _| {
            spawn_resync(Arc::downgrade(inner));
        });

        Self {
            inner,
            subscriptions,
        }
    }

    /// Append an optimistic message and send it.
    ///
    /// The message is visible (pending, with a temp id) before this awaits the
    /// socket write. Returns the temp id; the confirmation swaps it for the
    /// server id in place.
    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        content: &str,
    ) -> Result<MessageId, ChatError> {
        let content = normalize_content(content).map_err(|_| ChatError::EmptyContent)?;
        let message = ChatMessage::optimistic(
            chat_id.clone(),
            self.inner.identity.user_id.clone(),
            self.inner.identity.username.clone(),
            content.clone(),
            Utc::now(),
        );
        let temp_id = message.id.clone();

        {
            let mut state = self.inner.state();
            state
                .chats
                .entry(chat_id.clone())
                .or_default()
                .messages
                .push(message);
            state.pending.insert(
                temp_id.to_string(),
                Pending {
                    op: PendingOp::Send {
                        chat_id: chat_id.clone(),
                        temp_id: temp_id.clone(),
                    },
                    timer: None,
                },
            );
        }
        self.inner.notify(chat_id);

        self.inner
            .deliver_send(chat_id.clone(), temp_id, content)
            .await
    }

    /// Send a failed message again under the same temp id.
    pub async fn retry_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let (chat_id, content) = {
            let mut state = self.inner.state();
            let (chat_id, _) = state
                .locate(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            let message = state
                .message_mut(&chat_id, message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            if message.ack_state != AckState::Failed || !message.id.is_temporary() {
                return Err(ChatError::NotFailed(message_id.clone()));
            }
            message.ack_state = AckState::Pending;
            let content = message.content.clone();
            state.pending.insert(
                message_id.to_string(),
                Pending {
                    op: PendingOp::Send {
                        chat_id: chat_id.clone(),
                        temp_id: message_id.clone(),
                    },
                    timer: None,
                },
            );
            (chat_id, content)
        };
        self.inner.notify(&chat_id);

        self.inner
            .deliver_send(chat_id, message_id.clone(), content)
            .await
            .map(|_| ())
    }

    /// Drop a failed message from the list.
    pub fn discard_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let chat_id = {
            let mut state = self.inner.state();
            let (chat_id, idx) = state
                .locate(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            let Some(conv) = state.chats.get_mut(&chat_id) else {
                return Err(ChatError::MessageNotFound(message_id.clone()));
            };
            if conv.messages[idx].ack_state != AckState::Failed {
                return Err(ChatError::NotFailed(message_id.clone()));
            }
            conv.messages.remove(idx);
            chat_id
        };
        self.inner.notify(&chat_id);
        Ok(())
    }

    /// Optimistically replace the content of a confirmed message.
    pub async fn edit_message(
        &self,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), ChatError> {
        let content = normalize_content(new_content).map_err(|_| ChatError::EmptyContent)?;
        let correlation_id = Uuid::new_v4().to_string();

        let chat_id = {
            let mut state = self.inner.state();
            let (chat_id, _) = state
                .locate(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            let message = state
                .message_mut(&chat_id, message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            check_mutable(message)?;

            let previous = std::mem::replace(&mut message.content, content.clone());
            let previous_edited_at = message.edited_at;
            state.pending.insert(
                correlation_id.clone(),
                Pending {
                    op: PendingOp::Edit {
                        chat_id: chat_id.clone(),
                        message_id: message_id.clone(),
                        previous,
                        previous_edited_at,
                    },
                    timer: None,
                },
            );
            chat_id
        };
        self.inner.notify(&chat_id);

        let request = ClientMessage::ChatEdit(ChatEditPayload {
            chat_id,
            message_id: message_id.clone(),
            content,
            correlation_id: correlation_id.clone(),
        });
        self.inner
            .deliver(request, &correlation_id, message_id)
            .await
    }

    /// Tombstone a confirmed message until the server confirms the delete.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ChatError> {
        let correlation_id = Uuid::new_v4().to_string();

        let chat_id = {
            let mut state = self.inner.state();
            let (chat_id, _) = state
                .locate(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            let message = state
                .message_mut(&chat_id, message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.clone()))?;
            check_mutable(message)?;

            let previous_deleted_at = message.deleted_at.replace(Utc::now());
            state.pending.insert(
                correlation_id.clone(),
                Pending {
                    op: PendingOp::Delete {
                        chat_id: chat_id.clone(),
                        message_id: message_id.clone(),
                        previous_deleted_at,
                    },
                    timer: None,
                },
            );
            chat_id
        };
        self.inner.notify(&chat_id);

        let request = ClientMessage::ChatDelete(ChatDeletePayload {
            chat_id,
            message_id: message_id.clone(),
            correlation_id: correlation_id.clone(),
        });
        self.inner
            .deliver(request, &correlation_id, message_id)
            .await
    }

    /// Tell the conversation we are typing.
    ///
    /// (Re)starts the local expiry window; if no `stop_typing` follows, the
    /// indicator clears itself and a stop is sent.
    pub async fn start_typing(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        let generation = self.inner.arm_local_typing(chat_id);
        let request = ClientMessage::ChatTypingStart(ChatRefPayload {
            chat_id: chat_id.clone(),
        });
        if let Err(e) = self.inner.connection.send(request).await {
            if let Some(timer) = self.inner.clear_local_typing(chat_id, Some(generation)) {
                timer.abort();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop typing. No-op if we are not typing in `chat_id`.
    pub async fn stop_typing(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        let Some(timer) = self.inner.clear_local_typing(chat_id, None) else {
            return Ok(());
        };
        timer.abort();
        let request = ClientMessage::ChatTypingStop(ChatRefPayload {
            chat_id: chat_id.clone(),
        });
        self.inner.connection.send(request).await?;
        Ok(())
    }

    /// Reset the unread count and report the read boundary.
    ///
    /// Idempotent. While offline the boundary is remembered and sent after the
    /// next reconnect.
    pub async fn mark_as_read(&self, chat_id: &ChatId) {
        let boundary = {
            let mut state = self.inner.state();
            let Some(conv) = state.chats.get_mut(chat_id) else {
                return;
            };
            if conv.unread == 0 && !conv.read_unsent {
                return;
            }
            conv.unread = 0;
            conv.read_boundary = conv
                .messages
                .iter()
                .rev()
                .find(|m| !m.id.is_temporary())
                .map(|m| m.id.clone());
            conv.read_unsent = true;
            conv.read_boundary.clone()
        };
        self.inner.notify(chat_id);

        let request = ClientMessage::ChatMarkRead(MarkReadPayload {
            chat_id: chat_id.clone(),
            last_read_message_id: boundary.clone(),
        });
        match self.inner.connection.send(request).await {
            Ok(()) => self.inner.read_boundary_sent(chat_id, &boundary),
            Err(ConnectionError::NotConnected) => {
                tracing::debug!(chat_id = %chat_id, "Offline; read boundary kept for resync");
            }
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Could not send read boundary");
            }
        }
    }

    /// Merge fetched history without duplicating known messages.
    pub fn seed_history(&self, chat_id: &ChatId, messages: Vec<ChatMessage>) {
        self.inner.merge_history(chat_id, messages);
    }

    /// Messages of one conversation in display order.
    pub fn messages(&self, chat_id: &ChatId) -> Vec<ChatMessage> {
        self.inner
            .state()
            .chats
            .get(chat_id)
            .map(|conv| conv.messages.clone())
            .unwrap_or_default()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<ChatMessage> {
        let state = self.inner.state();
        let (chat_id, idx) = state.locate(message_id)?;
        state.chats.get(&chat_id)?.messages.get(idx).cloned()
    }

    pub fn unread_count(&self, chat_id: &ChatId) -> u32 {
        self.inner
            .state()
            .chats
            .get(chat_id)
            .map_or(0, |conv| conv.unread)
    }

    /// Remote participants currently typing in `chat_id`.
    pub fn typing_users(&self, chat_id: &ChatId) -> Vec<TypingState> {
        let now = Utc::now();
        let mut typing: Vec<TypingState> = self
            .inner
            .state()
            .remote_typing
            .values()
            .map(|(typing, _)| typing)
            .filter(|t| &t.chat_id == chat_id && !t.is_expired(now))
            .cloned()
            .collect();
        typing.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        typing
    }

    /// Whether our own typing indicator is active in `chat_id`.
    pub fn is_typing(&self, chat_id: &ChatId) -> bool {
        self.inner.state().local_typing.contains_key(chat_id)
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn loaded_chats(&self) -> Vec<ChatId> {
        let mut chats: Vec<ChatId> = self.inner.state().chats.keys().cloned().collect();
        chats.sort();
        chats
    }
}

impl Drop for ChatSynchronizer {
    fn drop(&mut self) {
        for handle in self.subscriptions.drain(..) {
            self.inner.events.unsubscribe(handle);
        }
        let mut state = self.inner.state();
        for pending in state.pending.values() {
            if let Some(timer) = &pending.timer {
                timer.abort();
            }
        }
        for timer in state.local_typing.values() {
            timer.handle.abort();
        }
        for (_, timer) in state.remote_typing.values() {
            timer.handle.abort();
        }
        state.pending.clear();
    }
}

fn check_mutable(message: &ChatMessage) -> Result<(), ChatError> {
    if message.id.is_temporary() {
        return Err(ChatError::NotConfirmed(message.id.clone()));
    }
    if message.is_deleted() {
        return Err(ChatError::Deleted(message.id.clone()));
    }
    Ok(())
}

impl ChatInner {
    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, chat_id: &ChatId) {
        self.events.publish(PlayerEvent::ChatUpdated {
            chat_id: chat_id.clone(),
        });
    }

    async fn deliver_send(
        self: &Arc<Self>,
        chat_id: ChatId,
        temp_id: MessageId,
        content: String,
    ) -> Result<MessageId, ChatError> {
        let request = ClientMessage::ChatSend(ChatSendPayload {
            chat_id,
            temp_id: temp_id.clone(),
            content,
        });
        let key = temp_id.to_string();
        self.deliver(request, &key, &temp_id).await?;
        Ok(temp_id)
    }

    /// Write a request whose pending entry is already registered under `key`.
    async fn deliver(
        self: &Arc<Self>,
        request: ClientMessage,
        key: &str,
        message_id: &MessageId,
    ) -> Result<(), ChatError> {
        match self.connection.send(request).await {
            Ok(()) => {
                self.arm_ack_timer(key);
                Ok(())
            }
            Err(source) => {
                self.fail_pending(key, &source.to_string());
                Err(ChatError::Delivery {
                    message_id: message_id.clone(),
                    source,
                })
            }
        }
    }

    fn arm_ack_timer(self: &Arc<Self>, key: &str) {
        let window = Duration::from_millis(self.config.ack_timeout_ms);
        let weak = Arc::downgrade(self);
        let mut state = self.state();
        // Already acked (or failed) while the write was in flight
        let Some(pending) = state.pending.get_mut(key) else {
            return;
        };

        let key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.fail_pending(&key, "no acknowledgement from server");
            }
        });
        pending.timer = Some(task.abort_handle());
    }

    fn fail_pending(&self, key: &str, reason: &str) {
        let chat_id = {
            let mut state = self.state();
            let Some(pending) = state.pending.remove(key) else {
                return;
            };
            if let Some(timer) = pending.timer {
                timer.abort();
            }
            tracing::warn!(correlation_id = %key, reason = %reason, op = ?pending.op, "Chat operation failed");
            state.fail(pending.op)
        };
        self.notify(&chat_id);
    }

    fn on_message(&self, inbound: InboundChatMessage) {
        let InboundChatMessage {
            message: mut incoming,
            temp_id,
        } = inbound;
        incoming.ack_state = AckState::Confirmed;
        let chat_id = incoming.chat_id.clone();
        let own = incoming.sender_id == self.identity.user_id;

        let changed = {
            let mut state = self.state();

            // Our own broadcast without a temp id confirms the oldest matching unconfirmed send
            let temp_id = temp_id.or_else(|| {
                if !own {
                    return None;
                }
                state
                    .chats
                    .get(&chat_id)
                    .and_then(|conv| conv.unconfirmed_send(&incoming.sender_id, &incoming.content))
            });

            if let Some(temp_id) = &temp_id {
                state.resolve(temp_id.as_str());
            }

            let conv = state.chats.entry(chat_id.clone()).or_default();
            let slot = temp_id.as_ref().and_then(|t| conv.position(t));
            match slot {
                Some(mut idx) => {
                    // The broadcast may have beaten the ack; keep only the optimistic slot
                    if let Some(dup) = conv.position(&incoming.id) {
                        conv.messages.remove(dup);
                        if dup < idx {
                            idx -= 1;
                        }
                    }
                    conv.messages[idx] = incoming;
                    true
                }
                None => match conv.position(&incoming.id) {
                    Some(idx) if conv.messages[idx] == incoming => false,
                    Some(idx) => {
                        conv.messages[idx] = incoming;
                        true
                    }
                    None => {
                        if !own {
                            conv.unread += 1;
                        }
                        conv.insert_sorted(incoming);
                        true
                    }
                },
            }
        };

        if changed {
            self.notify(&chat_id);
        }
    }

    fn on_edited(&self, payload: &MessageEditedPayload) {
        let changed = {
            let mut state = self.state();
            if let Some(correlation_id) = &payload.correlation_id {
                state.resolve(correlation_id);
            }
            match state.message_mut(&payload.chat_id, &payload.message_id) {
                Some(message) => {
                    message.content = payload.content.clone();
                    message.edited_at = Some(payload.edited_at);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify(&payload.chat_id);
        }
    }

    fn on_deleted(&self, payload: &MessageDeletedPayload) {
        let changed = {
            let mut state = self.state();
            if let Some(correlation_id) = &payload.correlation_id {
                state.resolve(correlation_id);
            }
            match state.message_mut(&payload.chat_id, &payload.message_id) {
                Some(message) => {
                    let deleted_at = payload
                        .deleted_at
                        .or(message.deleted_at)
                        .unwrap_or_else(Utc::now);
                    message.deleted_at = Some(deleted_at);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.notify(&payload.chat_id);
        }
    }

    fn on_rejected(&self, payload: &ErrorPayload) {
        let key = payload
            .correlation_id
            .clone()
            .or_else(|| payload.temp_id.as_ref().map(|id| id.to_string()));
        if let Some(key) = key {
            let reason = format!("{}: {}", payload.code, payload.message);
            self.fail_pending(&key, &reason);
        }
    }

    fn on_closed(&self) {
        let affected: HashSet<ChatId> = {
            let mut state = self.state();
            let pending: Vec<Pending> = state.pending.drain().map(|(_, p)| p).collect();
            let mut affected = HashSet::new();
            for entry in pending {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                affected.insert(state.fail(entry.op));
            }
            for (_, (typing, timer)) in state.remote_typing.drain() {
                timer.handle.abort();
                affected.insert(typing.chat_id);
            }
            for (_, timer) in state.local_typing.drain() {
                timer.handle.abort();
            }
            affected
        };

        if !affected.is_empty() {
            tracing::info!(chats = affected.len(), "Connection closed; in-flight chat operations failed");
        }
        for chat_id in &affected {
            self.notify(chat_id);
        }
    }

    fn on_typing(self: &Arc<Self>, payload: &TypingPayload) {
        if payload.user_id == self.identity.user_id {
            return;
        }
        let key = (payload.chat_id.clone(), payload.user_id.clone());

        {
            let mut state = self.state();
            if payload.is_typing {
                let generation = state.next_generation();
                let window = Duration::from_millis(self.config.typing_timeout_ms);
                let typing = TypingState::new(
                    payload.chat_id.clone(),
                    payload.user_id.clone(),
                    payload.username.clone(),
                    Utc::now(),
                    chrono::Duration::milliseconds(self.config.typing_timeout_ms as i64),
                );

                let weak = Arc::downgrade(self);
                let expiring = key.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire_remote_typing(expiring, generation);
                    }
                });
                let timer = Timer {
                    generation,
                    handle: task.abort_handle(),
                };
                if let Some((_, old)) = state.remote_typing.insert(key, (typing, timer)) {
                    old.handle.abort();
                }
            } else if let Some((_, old)) = state.remote_typing.remove(&key) {
                old.handle.abort();
            }
        }
        self.notify(&payload.chat_id);
    }

    fn expire_remote_typing(&self, key: (ChatId, UserId), generation: u64) {
        let expired = {
            let mut state = self.state();
            match state.remote_typing.get(&key) {
                Some((_, timer)) if timer.generation == generation => {
                    state.remote_typing.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if expired {
            tracing::debug!(chat_id = %key.0, user_id = %key.1, "Remote typing indicator expired");
            self.notify(&key.0);
        }
    }

    fn arm_local_typing(self: &Arc<Self>, chat_id: &ChatId) -> u64 {
        let window = Duration::from_millis(self.config.typing_timeout_ms);
        let weak = Arc::downgrade(self);
        let mut state = self.state();
        let generation = state.next_generation();

        let chat = chat_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.clear_local_typing(&chat, Some(generation)).is_none() {
                return;
            }
            tracing::debug!(chat_id = %chat, "Typing indicator expired");
            let connection = Arc::clone(&inner.connection);
            drop(inner);
            let request = ClientMessage::ChatTypingStop(ChatRefPayload { chat_id: chat });
            if let Err(e) = connection.send(request).await {
                tracing::debug!(error = %e, "Could not send typing stop");
            }
        });

        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        if let Some(old) = state.local_typing.insert(chat_id.clone(), timer) {
            old.handle.abort();
        }
        generation
    }

    /// Remove our typing indicator; with `generation`, only if it is still
    /// that one. Hands back the expiry timer of the removed indicator.
    fn clear_local_typing(&self, chat_id: &ChatId, generation: Option<u64>) -> Option<AbortHandle> {
        let mut state = self.state();
        let current = state.local_typing.get(chat_id)?.generation;
        if generation.is_some_and(|g| g != current) {
            return None;
        }
        state.local_typing.remove(chat_id).map(|timer| timer.handle)
    }

    fn merge_history(&self, chat_id: &ChatId, history: Vec<ChatMessage>) {
        {
            let mut state = self.state();
            let locked: HashSet<MessageId> = state
                .pending
                .values()
                .filter_map(|p| match &p.op {
                    PendingOp::Edit { message_id, .. } | PendingOp::Delete { message_id, .. } => {
                        Some(message_id.clone())
                    }
                    PendingOp::Send { .. } => None,
                })
                .collect();

            let own = &self.identity.user_id;
            let mut confirmed_sends = Vec::new();
            let conv = state.chats.entry(chat_id.clone()).or_default();
            for mut message in history {
                if &message.chat_id != chat_id {
                    continue;
                }
                message.ack_state = AckState::Confirmed;
                match conv.position(&message.id) {
                    // Keep our optimistic version until its edit/delete resolves
                    Some(_) if locked.contains(&message.id) => {}
                    Some(idx) => conv.messages[idx] = message,
                    None => {
                        // A send whose ack was lost with the socket shows up in history
                        let slot = (&message.sender_id == own)
                            .then(|| conv.unconfirmed_send(own, &message.content))
                            .flatten()
                            .and_then(|temp_id| {
                                conv.position(&temp_id).map(|idx| (temp_id, idx))
                            });
                        match slot {
                            Some((temp_id, idx)) => {
                                conv.messages[idx] = message;
                                confirmed_sends.push(temp_id);
                            }
                            None => conv.messages.push(message),
                        }
                    }
                }
            }
            conv.messages.sort_by_key(|m| m.created_at);

            for temp_id in confirmed_sends {
                state.resolve(temp_id.as_str());
            }
        }
        self.notify(chat_id);
    }

    fn unsent_read_boundaries(&self) -> Vec<(ChatId, Option<MessageId>)> {
        self.state()
            .chats
            .iter()
            .filter(|(_, conv)| conv.read_unsent)
            .map(|(chat_id, conv)| (chat_id.clone(), conv.read_boundary.clone()))
            .collect()
    }

    fn read_boundary_sent(&self, chat_id: &ChatId, boundary: &Option<MessageId>) {
        if let Some(conv) = self.state().chats.get_mut(chat_id) {
            if &conv.read_boundary == boundary {
                conv.read_unsent = false;
            }
        }
    }
}

/// Refetch loaded conversations and flush read boundaries kept while offline.
fn spawn_resync(weak: Weak<ChatInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let chat_ids: Vec<ChatId> = inner.state().chats.keys().cloned().collect();
    let snapshots = inner.snapshots.clone();
    let connection = Arc::clone(&inner.connection);
    drop(inner);

    tokio::spawn(async move {
        for (chat_id, boundary) in weak
            .upgrade()
            .map(|inner| inner.unsent_read_boundaries())
            .unwrap_or_default()
        {
            let request = ClientMessage::ChatMarkRead(MarkReadPayload {
                chat_id: chat_id.clone(),
                last_read_message_id: boundary.clone(),
            });
            match connection.send(request).await {
                Ok(()) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.read_boundary_sent(&chat_id, &boundary);
                    }
                }
                Err(e) => tracing::debug!(chat_id = %chat_id, error = %e, "Read boundary flush failed"),
            }
        }

        let Some(snapshots) = snapshots else {
            return;
        };
        for chat_id in chat_ids {
            match snapshots.chat_history(&chat_id).await {
                Ok(history) => match weak.upgrade() {
                    Some(inner) => inner.merge_history(&chat_id, history),
                    None => return,
                },
                Err(e) => {
                    tracing::warn!(chat_id = %chat_id, error = %e, "Chat history resync failed")
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::infrastructure::messaging::ConnectionState;
    use crate::infrastructure::testing::{at, server_message, MemoryConnector, MemoryServer, MemoryServers};
    use crate::ports::outbound::MockSnapshotSource;
    use serde_json::json;

    struct Harness {
        chat: ChatSynchronizer,
        manager: Arc<ConnectionManager>,
        server: MemoryServer,
        servers: MemoryServers,
    }

    async fn harness_with(snapshots: Option<Arc<dyn SnapshotSource>>) -> Harness {
        let (connector, mut servers) = MemoryConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            ConnectionConfig::default(),
            connector,
            EventBus::new(),
        ));
        let chat = ChatSynchronizer::new(
            SessionIdentity::new("me", "me"),
            ChatConfig::default(),
            Arc::clone(&manager),
            snapshots,
        );
        manager.connect("token").await.expect("connect");
        let mut server = servers.next().await.expect("server");
        assert!(matches!(server.recv().await, Some(ClientMessage::Auth(_))));
        Harness {
            chat,
            manager,
            server,
            servers,
        }
    }

    async fn harness() -> Harness {
        harness_with(None).await
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn push_message(server: &MemoryServer, message: &ChatMessage, temp_id: Option<&MessageId>) {
        let mut payload = serde_json::to_value(message).expect("serialize");
        if let Some(temp_id) = temp_id {
            payload["tempId"] = json!(temp_id);
        }
        server.push("chat:message", payload);
    }

    fn ids(messages: &[ChatMessage]) -> Vec<String> {
        messages.iter().map(|m| m.id.to_string()).collect()
    }

    fn chat1() -> ChatId {
        ChatId::from("chat1")
    }

    #[tokio::test(start_paused = true)]
    async fn sent_message_appears_once_and_is_confirmed_in_place() {
        let mut h = harness().await;
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "u2", "hello", 0)]);

        let temp_id = h.chat.send_message(&chat1(), "  hi  ").await.expect("send");

        let before = h.chat.messages(&chat1());
        assert_eq!(ids(&before), vec!["srv-1".to_string(), temp_id.to_string()]);
        assert_eq!(before[1].ack_state, AckState::Pending);
        assert_eq!(before[1].content, "hi");

        let Some(ClientMessage::ChatSend(sent)) = h.server.recv().await else {
            panic!("expected chat:send");
        };
        assert_eq!(sent.temp_id, temp_id);

        let mut confirmed = server_message("srv-42", "chat1", "me", "hi", 1);
        confirmed.created_at = before[1].created_at;
        push_message(&h.server, &confirmed, Some(&temp_id));
        settle().await;

        let after = h.chat.messages(&chat1());
        assert_eq!(ids(&after), vec!["srv-1", "srv-42"]);
        assert_eq!(after[1].ack_state, AckState::Confirmed);
        assert_eq!(h.chat.pending_operations(), 0);
        assert_eq!(h.chat.unread_count(&chat1()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_before_ack_does_not_duplicate() {
        let h = harness().await;
        let temp_id = h.chat.send_message(&chat1(), "hi").await.expect("send");
        let created_at = h.chat.messages(&chat1())[0].created_at;

        let mut echo = server_message("srv-7", "chat1", "me", "hi", 0);
        echo.created_at = created_at;
        push_message(&h.server, &echo, None);
        push_message(&h.server, &echo, Some(&temp_id));
        settle().await;

        let messages = h.chat.messages(&chat1());
        assert_eq!(ids(&messages), vec!["srv-7"]);
        assert_eq!(messages[0].ack_state, AckState::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_fails_message_without_duplicates_and_retry_resends() {
        let mut h = harness().await;
        let temp_id = h.chat.send_message(&chat1(), "anyone?").await.expect("send");
        h.server.recv().await.expect("chat:send");

        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let messages = h.chat.messages(&chat1());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, temp_id);
        assert_eq!(messages[0].ack_state, AckState::Failed);

        h.chat.retry_message(&temp_id).await.expect("retry");
        assert_eq!(
            h.chat.message(&temp_id).map(|m| m.ack_state),
            Some(AckState::Pending)
        );
        let Some(ClientMessage::ChatSend(resent)) = h.server.recv().await else {
            panic!("expected chat:send");
        };
        assert_eq!(resent.temp_id, temp_id);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_can_be_discarded() {
        let h = harness().await;
        h.manager.disconnect();

        let err = h
            .chat
            .send_message(&chat1(), "lost")
            .await
            .expect_err("not connected");
        let ChatError::Delivery { message_id, source } = err else {
            panic!("expected delivery error");
        };
        assert_eq!(source, ConnectionError::NotConnected);
        assert_eq!(
            h.chat.message(&message_id).map(|m| m.ack_state),
            Some(AckState::Failed)
        );

        h.chat.discard_message(&message_id).expect("discard");
        assert!(h.chat.messages(&chat1()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_content_is_rejected_before_anything_happens() {
        let h = harness().await;

        assert_eq!(
            h.chat.send_message(&chat1(), " \n ").await,
            Err(ChatError::EmptyContent)
        );
        assert!(h.chat.messages(&chat1()).is_empty());
        assert_eq!(h.chat.pending_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_edit_takes_server_timestamp() {
        let mut h = harness().await;
        let id = MessageId::from("srv-1");
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "me", "helo", 0)]);

        h.chat.edit_message(&id, "hello").await.expect("edit");
        assert_eq!(h.chat.message(&id).map(|m| m.content), Some("hello".into()));

        let Some(ClientMessage::ChatEdit(edit)) = h.server.recv().await else {
            panic!("expected chat:edit");
        };
        h.server.push(
            "chat:message_edited",
            json!({
                "chatId": "chat1",
                "messageId": "srv-1",
                "content": "hello",
                "editedAt": at(60),
                "correlationId": edit.correlation_id,
            }),
        );
        settle().await;

        let message = h.chat.message(&id).expect("message");
        assert_eq!(message.edited_at, Some(at(60)));
        assert_eq!(h.chat.pending_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_edit_reverts_content() {
        let mut h = harness().await;
        let id = MessageId::from("srv-1");
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "me", "original", 0)]);

        h.chat.edit_message(&id, "changed").await.expect("edit");
        let Some(ClientMessage::ChatEdit(edit)) = h.server.recv().await else {
            panic!("expected chat:edit");
        };
        h.server.push(
            "error",
            json!({"code": "forbidden", "message": "too late", "correlationId": edit.correlation_id}),
        );
        settle().await;

        let message = h.chat.message(&id).expect("message");
        assert_eq!(message.content, "original");
        assert_eq!(message.edited_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_tombstones_and_rejection_restores() {
        let mut h = harness().await;
        let id = MessageId::from("srv-1");
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "me", "oops", 0)]);

        h.chat.delete_message(&id).await.expect("delete");
        let tombstone = h.chat.message(&id).expect("message kept");
        assert_eq!(tombstone.display_content(), None);

        let Some(ClientMessage::ChatDelete(delete)) = h.server.recv().await else {
            panic!("expected chat:delete");
        };
        h.server.push(
            "error",
            json!({"code": "forbidden", "correlationId": delete.correlation_id}),
        );
        settle().await;

        assert_eq!(
            h.chat.message(&id).and_then(|m| m.display_content().map(str::to_string)),
            Some("oops".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_or_deleted_messages_cannot_be_changed() {
        let h = harness().await;
        let temp_id = h.chat.send_message(&chat1(), "hi").await.expect("send");

        assert_eq!(
            h.chat.edit_message(&temp_id, "edited").await,
            Err(ChatError::NotConfirmed(temp_id.clone()))
        );
        assert_eq!(
            h.chat.delete_message(&MessageId::from("nope")).await,
            Err(ChatError::MessageNotFound(MessageId::from("nope")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_broadcast_is_sorted_by_timestamp() {
        let h = harness().await;
        h.chat.seed_history(
            &chat1(),
            vec![
                server_message("b", "chat1", "u2", "second", 30),
                server_message("a", "chat1", "u2", "first", 10),
            ],
        );
        assert_eq!(ids(&h.chat.messages(&chat1())), vec!["a", "b"]);

        push_message(&h.server, &server_message("m", "chat1", "u3", "middle", 20), None);
        settle().await;

        assert_eq!(ids(&h.chat.messages(&chat1())), vec!["a", "m", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_expires_without_stop() {
        let mut h = harness().await;

        h.chat.start_typing(&chat1()).await.expect("start");
        assert!(h.chat.is_typing(&chat1()));
        assert!(matches!(
            h.server.recv().await,
            Some(ClientMessage::ChatTypingStart(_))
        ));

        tokio::time::sleep(Duration::from_millis(3_100)).await;

        assert!(!h.chat.is_typing(&chat1()));
        assert!(matches!(
            h.server.recv().await,
            Some(ClientMessage::ChatTypingStop(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_expiry() {
        let mut h = harness().await;

        h.chat.start_typing(&chat1()).await.expect("start");
        h.chat.stop_typing(&chat1()).await.expect("stop");
        h.chat.stop_typing(&chat1()).await.expect("second stop is a no-op");
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        h.chat.start_typing(&ChatId::from("chat2")).await.expect("start");

        assert!(matches!(h.server.recv().await, Some(ClientMessage::ChatTypingStart(_))));
        assert!(matches!(h.server.recv().await, Some(ClientMessage::ChatTypingStop(_))));
        // Next frame is the chat2 start: no second stop from an expired timer
        let Some(ClientMessage::ChatTypingStart(next)) = h.server.recv().await else {
            panic!("expected chat2 typing start");
        };
        assert_eq!(next.chat_id, ChatId::from("chat2"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_expires_within_window() {
        let h = harness().await;
        h.server.push(
            "chat:typing",
            json!({"chatId": "chat1", "userId": "u2", "username": "bob", "isTyping": true}),
        );
        settle().await;
        assert_eq!(h.chat.typing_users(&chat1()).len(), 1);

        tokio::time::sleep(Duration::from_millis(3_100)).await;

        assert!(h.chat.typing_users(&chat1()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_as_read_twice_is_harmless() {
        let mut h = harness().await;
        push_message(&h.server, &server_message("srv-1", "chat1", "u2", "ping", 0), None);
        settle().await;
        assert_eq!(h.chat.unread_count(&chat1()), 1);

        h.chat.mark_as_read(&chat1()).await;
        assert_eq!(h.chat.unread_count(&chat1()), 0);
        h.chat.mark_as_read(&chat1()).await;
        assert_eq!(h.chat.unread_count(&chat1()), 0);

        let Some(ClientMessage::ChatMarkRead(read)) = h.server.recv().await else {
            panic!("expected chat:mark_read");
        };
        assert_eq!(read.last_read_message_id, Some(MessageId::from("srv-1")));

        // Only one mark_read went out
        h.chat.start_typing(&chat1()).await.expect("start");
        assert!(matches!(h.server.recv().await, Some(ClientMessage::ChatTypingStart(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_connection_fails_in_flight_operations() {
        let h = harness().await;
        let id = MessageId::from("srv-1");
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "me", "keep", 0)]);
        let temp_id = h.chat.send_message(&chat1(), "hi").await.expect("send");
        h.chat.edit_message(&id, "changed").await.expect("edit");

        h.manager.disconnect();

        assert_eq!(
            h.chat.message(&temp_id).map(|m| m.ack_state),
            Some(AckState::Failed)
        );
        assert_eq!(h.chat.message(&id).map(|m| m.content), Some("keep".into()));
        assert_eq!(h.chat.pending_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_boundary_from_offline_is_flushed_after_reconnect() {
        let mut h = harness().await;
        push_message(&h.server, &server_message("srv-1", "chat1", "u2", "ping", 0), None);
        settle().await;

        h.server.drop_connection();
        let mut observer = h.manager.watch();
        observer
            .wait_for(|s| s.state == ConnectionState::Reconnecting)
            .await
            .expect("reconnecting");

        h.chat.mark_as_read(&chat1()).await;
        assert_eq!(h.chat.unread_count(&chat1()), 0);

        let mut next = h.servers.next().await.expect("reconnected");
        assert!(matches!(next.recv().await, Some(ClientMessage::Auth(_))));
        let Some(ClientMessage::ChatMarkRead(read)) = next.recv().await else {
            panic!("expected flushed chat:mark_read");
        };
        assert_eq!(read.last_read_message_id, Some(MessageId::from("srv-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn resync_merges_history_without_duplicates() {
        let mut snapshots = MockSnapshotSource::new();
        snapshots.expect_chat_history().returning(|_| {
            Ok(vec![
                server_message("srv-1", "chat1", "u2", "hello", 0),
                server_message("srv-2", "chat1", "u2", "missed while away", 5),
            ])
        });
        let mut h = harness_with(Some(Arc::new(snapshots))).await;
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "u2", "hello", 0)]);

        h.server.drop_connection();
        let _next = h.servers.next().await.expect("reconnected");
        settle().await;

        assert_eq!(ids(&h.chat.messages(&chat1())), vec!["srv-1", "srv-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_confirms_send_whose_ack_was_lost() {
        let mut snapshots = MockSnapshotSource::new();
        snapshots.expect_chat_history().returning(|_| {
            Ok(vec![
                server_message("srv-1", "chat1", "u2", "hello", 0),
                server_message("srv-42", "chat1", "me", "hi", 3),
            ])
        });
        let mut h = harness_with(Some(Arc::new(snapshots))).await;
        h.chat
            .seed_history(&chat1(), vec![server_message("srv-1", "chat1", "u2", "hello", 0)]);
        let temp_id = h.chat.send_message(&chat1(), "hi").await.expect("send");
        h.server.recv().await.expect("chat:send");

        h.server.drop_connection();
        let _next = h.servers.next().await.expect("reconnected");
        settle().await;

        assert_eq!(ids(&h.chat.messages(&chat1())), vec!["srv-1", "srv-42"]);
        assert!(h.chat.message(&temp_id).is_none());
        assert_eq!(h.chat.pending_operations(), 0);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        let messages = h.chat.messages(&chat1());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].ack_state, AckState::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_echo_confirms_failed_send() {
        let mut h = harness().await;
        let temp_id = h.chat.send_message(&chat1(), "late").await.expect("send");
        h.server.recv().await.expect("chat:send");

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(
            h.chat.message(&temp_id).map(|m| m.ack_state),
            Some(AckState::Failed)
        );

        push_message(&h.server, &server_message("srv-9", "chat1", "me", "late", 1), None);
        settle().await;

        let messages = h.chat.messages(&chat1());
        assert_eq!(ids(&messages), vec!["srv-9"]);
        assert_eq!(messages[0].ack_state, AckState::Confirmed);
        assert_eq!(h.chat.unread_count(&chat1()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_synchronizer_ignores_late_timers() {
        let h = harness().await;
        let Harness {
            chat,
            manager,
            server: _server,
            servers: _servers,
        } = h;
        chat.send_message(&chat1(), "bye").await.expect("send");
        chat.start_typing(&chat1()).await.expect("start");

        drop(chat);
        tokio::time::sleep(Duration::from_millis(20_000)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.events().subscriber_count(EventKind::ChatMessage), 0);
    }
}
