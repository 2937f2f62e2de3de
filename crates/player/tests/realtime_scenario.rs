//! End-to-end session against the in-memory transport: connect, send a chat
//! message, and watch the server confirmation land in the same list slot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use launchpad_domain::{AckState, ChatId, UserId};
use launchpad_player::infrastructure::testing::MemoryConnector;
use launchpad_player::{
    ConnectionState, EventKind, PlayerEvent, RealtimeConfig, RealtimeCore, SessionIdentity,
};
use launchpad_shared::ClientMessage;

#[tokio::test(start_paused = true)]
async fn send_is_confirmed_in_place() {
    let (connector, mut servers) = MemoryConnector::new();
    let core = RealtimeCore::new(
        RealtimeConfig::default(),
        SessionIdentity::new("me", "me"),
        connector,
        None,
    );

    let opened = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&opened);
    let _open = core.events().subscribe_guarded(EventKind::ConnectionOpen, move |event| {
        if let PlayerEvent::ConnectionOpen { resumed } = event {
            seen.lock().expect("lock").push(*resumed);
        }
    });

    assert_eq!(core.connection().state(), ConnectionState::Disconnected);
    core.start("token").await.expect("connect");
    assert_eq!(core.connection().state(), ConnectionState::Connected);
    assert_eq!(*opened.lock().expect("lock"), vec![false]);

    let mut server = servers.next().await.expect("server side");
    let Some(ClientMessage::Auth(auth)) = server.recv().await else {
        panic!("expected auth frame first");
    };
    assert_eq!(auth.token, "token");

    let chat = ChatId::from("chat1");
    let temp_id = core.chat().send_message(&chat, "hi").await.expect("send");

    let pending = core.chat().messages(&chat);
    assert_eq!(pending.len(), 1);
    assert!(temp_id.is_temporary());
    assert_eq!(pending[0].id, temp_id);
    assert_eq!(pending[0].ack_state, AckState::Pending);

    let Some(ClientMessage::ChatSend(sent)) = server.recv().await else {
        panic!("expected chat:send");
    };
    assert_eq!(sent.content, "hi");

    server.push(
        "chat:message",
        json!({
            "id": "srv-42",
            "tempId": sent.temp_id,
            "chatId": "chat1",
            "senderId": "me",
            "senderUsername": "me",
            "content": "hi",
            "createdAt": pending[0].created_at,
        }),
    );
    tokio::time::sleep(Duration::from_millis(5)).await;

    let confirmed = core.chat().messages(&chat);
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id.as_str(), "srv-42");
    assert_eq!(confirmed[0].ack_state, AckState::Confirmed);
    assert_eq!(confirmed[0].sender_id, UserId::from("me"));
    assert_eq!(core.chat().pending_operations(), 0);

    core.shutdown();
    assert_eq!(core.connection().state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn friend_presence_survives_reconnect_without_false_online() {
    let (connector, mut servers) = MemoryConnector::new();
    let core = RealtimeCore::new(
        RealtimeConfig::default(),
        SessionIdentity::new("me", "me"),
        connector,
        None,
    );
    core.start("token").await.expect("connect");
    let mut server = servers.next().await.expect("server side");
    server.recv().await.expect("auth");

    let friend = UserId::from("u1");
    server.push(
        "presence:update",
        json!({"userId": "u1", "username": "alice", "event": "user_online", "at": "2024-05-01T10:00:00Z"}),
    );
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(core.presence().get_online_friends(&[friend.clone()]).len(), 1);

    server.drop_connection();
    let mut observer = core.watch_connection();
    observer
        .wait_for(|s| s.state == ConnectionState::Reconnecting)
        .await
        .expect("reconnecting");
    assert!(core.presence().get_online_friends(&[friend.clone()]).is_empty());

    let mut next = servers.next().await.expect("reconnected");
    next.recv().await.expect("auth");
    assert!(core.presence().get_online_friends(&[friend.clone()]).is_empty());

    next.push(
        "presence:update",
        json!({"userId": "u1", "username": "alice", "event": "user_offline", "at": "2024-05-01T10:05:00Z"}),
    );
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(core.presence().get_online_friends(&[friend.clone()]).is_empty());
    assert!(!core.presence().is_stale(&friend));
}
