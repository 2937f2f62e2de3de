//! PresenceTracker - live online/playing/offline status of friends
//!
//! Status only ever changes because of an inbound `presence:update`, a presence
//! snapshot, or a lost connection. A lost connection never flips anyone to
//! offline; every entry is flagged stale and displays as `Unknown` until fresh
//! data for that user arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;

use launchpad_domain::{DisplayStatus, PresenceEntry, PresenceStatus, UserId};
use launchpad_shared::PresenceUpdatePayload;

use crate::infrastructure::messaging::{ConnectionState, EventBus, SubscriptionHandle};
use crate::ports::outbound::{EventKind, PlayerEvent, SnapshotSource};

#[derive(Debug, Clone)]
struct Tracked {
    entry: PresenceEntry,
    stale: bool,
}

struct PresenceInner {
    events: EventBus,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    entries: Mutex<HashMap<UserId, Tracked>>,
}

impl PresenceInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<UserId, Tracked>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks friend presence from the realtime stream.
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl PresenceTracker {
    /// Create a tracker and subscribe it to the bus.
    ///
    /// `snapshots` is used to refetch presence after a reconnect; without it
    /// entries stay unknown until pushed updates arrive.
    pub fn new(events: EventBus, snapshots: Option<Arc<dyn SnapshotSource>>) -> Self {
        let inner = Arc::new(PresenceInner {
            events: events.clone(),
            snapshots,
            entries: Mutex::new(HashMap::new()),
        });

        let mut subscriptions = Vec::new();

        let weak = Arc::downgrade(&inner);
        subscriptions.push(events.subscribe(EventKind::PresenceUpdate, move |event| {
            if let (Some(inner), PlayerEvent::PresenceUpdate(payload)) = (weak.upgrade(), event) {
                apply_update(&inner, payload);
            }
        }));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(events.subscribe(EventKind::ConnectionClosed, move |_| {
            if let Some(inner) = weak.upgrade() {
                degrade(&inner);
            }
        }));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(events.subscribe(EventKind::ConnectionStatus, move |event| {
            if let PlayerEvent::ConnectionStatus(snapshot) = event {
                if snapshot.state == ConnectionState::Reconnecting || snapshot.offline {
                    if let Some(inner) = weak.upgrade() {
                        degrade(&inner);
                    }
                }
            }
        }));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(events.subscribe(EventKind::ConnectionResync, move |_| {
            spawn_resync(weak.clone());
        }));

        Self {
            inner,
            subscriptions,
        }
    }

    /// Apply one presence event. Returns whether anything visible changed.
    pub fn apply(&self, update: &PresenceUpdatePayload) -> bool {
        apply_update(&self.inner, update)
    }

    /// Replace entries with an authoritative snapshot.
    pub fn seed(&self, entries: Vec<PresenceEntry>) {
        seed(&self.inner, entries);
    }

    /// Friends from `friend_ids` currently known to be online or playing,
    /// sorted by username for stable rendering.
    pub fn get_online_friends(&self, friend_ids: &[UserId]) -> Vec<PresenceEntry> {
        let entries = self.inner.entries();
        let mut online: Vec<PresenceEntry> = friend_ids
            .iter()
            .filter_map(|id| entries.get(id))
            .filter(|t| !t.stale && t.entry.status != PresenceStatus::Offline)
            .map(|t| t.entry.clone())
            .collect();
        drop(entries);

        online.sort_by(|a, b| {
            a.username
                .to_lowercase()
                .cmp(&b.username.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        online.dedup_by(|a, b| a.user_id == b.user_id);
        online
    }

    /// What to show for `user_id` right now.
    pub fn display_status(&self, user_id: &UserId) -> DisplayStatus {
        match self.inner.entries().get(user_id) {
            Some(tracked) if !tracked.stale => tracked.entry.reported_display(),
            _ => DisplayStatus::Unknown,
        }
    }

    /// Last known entry, stale or not.
    pub fn entry(&self, user_id: &UserId) -> Option<PresenceEntry> {
        self.inner.entries().get(user_id).map(|t| t.entry.clone())
    }

    pub fn is_stale(&self, user_id: &UserId) -> bool {
        self.inner.entries().get(user_id).is_some_and(|t| t.stale)
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.entries().len()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        for handle in self.subscriptions.drain(..) {
            self.inner.events.unsubscribe(handle);
        }
    }
}

fn apply_update(inner: &PresenceInner, update: &PresenceUpdatePayload) -> bool {
    let status = update.event.status();
    let observed_at = update.at.unwrap_or_else(Utc::now);

    let changed = {
        let mut entries = inner.entries();
        match entries.get_mut(&update.user_id) {
            Some(tracked) => {
                if let Some(username) = &update.username {
                    tracked.entry.username = username.clone();
                }
                let observed = tracked
                    .entry
                    .observe(status, update.server_name.clone(), observed_at);
                let accepted = observed_at >= tracked.entry.last_seen_at;
                let was_stale = tracked.stale;
                if accepted {
                    tracked.stale = false;
                }
                observed || (was_stale && accepted)
            }
            None => {
                let username = update
                    .username
                    .clone()
                    .unwrap_or_else(|| update.user_id.to_string());
                let mut entry =
                    PresenceEntry::new(update.user_id.clone(), username, status, observed_at);
                if status == PresenceStatus::Playing {
                    entry.playing_server = update.server_name.clone();
                }
                entries.insert(
                    update.user_id.clone(),
                    Tracked {
                        entry,
                        stale: false,
                    },
                );
                true
            }
        }
    };

    if changed {
        tracing::debug!(user_id = %update.user_id, status = ?status, "Presence updated");
        inner.events.publish(PlayerEvent::PresenceChanged {
            user_id: Some(update.user_id.clone()),
        });
    }
    changed
}

fn degrade(inner: &PresenceInner) {
    let degraded = {
        let mut entries = inner.entries();
        let mut degraded = 0usize;
        for tracked in entries.values_mut().filter(|t| !t.stale) {
            tracked.stale = true;
            degraded += 1;
        }
        degraded
    };

    if degraded > 0 {
        tracing::debug!(degraded, "Connection lost; presence is unknown");
        inner
            .events
            .publish(PlayerEvent::PresenceChanged { user_id: None });
    }
}

fn seed(inner: &PresenceInner, snapshot: Vec<PresenceEntry>) {
    {
        let mut entries = inner.entries();
        for entry in snapshot {
            match entries.get_mut(&entry.user_id) {
                // A pushed update newer than the snapshot wins
                Some(tracked) if tracked.entry.last_seen_at > entry.last_seen_at => {}
                _ => {
                    entries.insert(
                        entry.user_id.clone(),
                        Tracked {
                            entry,
                            stale: false,
                        },
                    );
                }
            }
        }
    }
    inner
        .events
        .publish(PlayerEvent::PresenceChanged { user_id: None });
}

fn spawn_resync(weak: Weak<PresenceInner>) {
    let Some(snapshots) = weak.upgrade().and_then(|inner| inner.snapshots.clone()) else {
        return;
    };

    tokio::spawn(async move {
        match snapshots.presence_snapshot().await {
            Ok(entries) => {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(count = entries.len(), "Presence resynced");
                    seed(&inner, entries);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Presence resync failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::messaging::ConnectionSnapshot;
    use crate::infrastructure::testing::{api_request_failed, at};
    use crate::ports::outbound::{CloseReason, MockSnapshotSource};
    use launchpad_shared::PresenceEvent;

    fn update(user: &str, name: &str, event: PresenceEvent, seconds: i64) -> PlayerEvent {
        PlayerEvent::PresenceUpdate(PresenceUpdatePayload {
            user_id: UserId::from(user),
            username: Some(name.to_string()),
            event,
            server_name: (event == PresenceEvent::UserPlaying).then(|| "EU-West #3".to_string()),
            at: Some(at(seconds)),
        })
    }

    fn ids(ids: &[&str]) -> Vec<UserId> {
        ids.iter().map(|id| UserId::from(*id)).collect()
    }

    fn names(entries: &[PresenceEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.username.as_str()).collect()
    }

    #[test]
    fn online_friends_are_filtered_and_sorted() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);

        events.publish(update("u3", "carol", PresenceEvent::UserOnline, 1));
        events.publish(update("u1", "Bob", PresenceEvent::UserPlaying, 2));
        events.publish(update("u2", "alice", PresenceEvent::UserOnline, 3));
        events.publish(update("u4", "dave", PresenceEvent::UserOffline, 4));
        events.publish(update("u9", "stranger", PresenceEvent::UserOnline, 5));

        let online = tracker.get_online_friends(&ids(&["u1", "u2", "u3", "u4"]));

        assert_eq!(names(&online), vec!["alice", "Bob", "carol"]);
        assert_eq!(
            tracker.display_status(&UserId::from("u1")),
            DisplayStatus::Playing {
                server_name: Some("EU-West #3".into())
            }
        );
    }

    #[test]
    fn out_of_order_update_is_ignored() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);

        events.publish(update("u1", "bob", PresenceEvent::UserOffline, 10));
        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 5));

        assert_eq!(tracker.display_status(&UserId::from("u1")), DisplayStatus::Offline);
    }

    #[test]
    fn closed_connection_degrades_to_unknown_and_keeps_last_seen() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);
        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 10));

        events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::Logout,
        });

        let bob = UserId::from("u1");
        assert_eq!(tracker.display_status(&bob), DisplayStatus::Unknown);
        assert!(tracker.get_online_friends(&[bob.clone()]).is_empty());
        assert_eq!(tracker.entry(&bob).map(|e| e.last_seen_at), Some(at(10)));
    }

    #[test]
    fn presence_recovers_only_after_fresh_update() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);
        let bob = UserId::from("u1");
        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 10));

        events.publish(PlayerEvent::ConnectionStatus(ConnectionSnapshot {
            state: ConnectionState::Reconnecting,
            attempt: 1,
            ..Default::default()
        }));
        assert_eq!(tracker.display_status(&bob), DisplayStatus::Unknown);

        // Reconnected, but nothing fresh yet: still not shown online
        events.publish(PlayerEvent::ConnectionOpen { resumed: true });
        assert_eq!(tracker.display_status(&bob), DisplayStatus::Unknown);

        events.publish(update("u1", "bob", PresenceEvent::UserOffline, 20));
        assert_eq!(tracker.display_status(&bob), DisplayStatus::Offline);
        assert!(!tracker.is_stale(&bob));
    }

    #[test]
    fn changes_are_announced() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);
        let changed = Arc::new(Mutex::new(Vec::new()));
        let changed_clone = Arc::clone(&changed);
        events.subscribe(EventKind::PresenceChanged, move |event| {
            if let PlayerEvent::PresenceChanged { user_id } = event {
                changed_clone.lock().expect("lock").push(user_id.clone());
            }
        });

        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 1));
        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 1));
        events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::Logout,
        });

        assert_eq!(
            *changed.lock().expect("lock"),
            vec![Some(UserId::from("u1")), None]
        );
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_refetches_snapshot() {
        let events = EventBus::new();
        let mut snapshots = MockSnapshotSource::new();
        snapshots.expect_presence_snapshot().times(1).returning(|| {
            Ok(vec![PresenceEntry::new(
                UserId::from("u1"),
                "bob",
                PresenceStatus::Online,
                at(30),
            )])
        });
        let tracker = PresenceTracker::new(events.clone(), Some(Arc::new(snapshots)));
        events.publish(update("u1", "bob", PresenceEvent::UserOffline, 10));
        events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::Logout,
        });

        events.publish(PlayerEvent::ConnectionResync);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(tracker.display_status(&UserId::from("u1")), DisplayStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resync_leaves_entries_unknown() {
        let events = EventBus::new();
        let mut snapshots = MockSnapshotSource::new();
        snapshots
            .expect_presence_snapshot()
            .returning(|| Err(api_request_failed("boom")));
        let tracker = PresenceTracker::new(events.clone(), Some(Arc::new(snapshots)));
        events.publish(update("u1", "bob", PresenceEvent::UserOnline, 10));
        events.publish(PlayerEvent::ConnectionClosed {
            reason: CloseReason::Logout,
        });

        events.publish(PlayerEvent::ConnectionResync);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(tracker.display_status(&UserId::from("u1")), DisplayStatus::Unknown);
    }

    #[test]
    fn dropping_tracker_unsubscribes() {
        let events = EventBus::new();
        let tracker = PresenceTracker::new(events.clone(), None);
        assert_eq!(events.subscriber_count(EventKind::PresenceUpdate), 1);

        drop(tracker);

        assert_eq!(events.subscriber_count(EventKind::PresenceUpdate), 0);
    }
}
