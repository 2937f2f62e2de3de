//! AdminTelemetryRelay - dashboard stats and the live activity feed
//!
//! Stats come from two sources: an authoritative REST snapshot and
//! `admin:stats_updated` deltas pushed over the socket. A snapshot replaces
//! whatever deltas accumulated; deltas stamped before the snapshot's `as_of`
//! are already reflected in it and get dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use launchpad_domain::{ActivityLogEntry, DashboardStats, StatsPatch};

use crate::config::TelemetryConfig;
use crate::infrastructure::messaging::{EventBus, SubscriptionHandle};
use crate::ports::outbound::{ApiError, EventKind, PlayerEvent, SnapshotSource};

/// Fixed-capacity activity feed, newest first.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    capacity: usize,
    entries: VecDeque<ActivityLogEntry>,
}

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Prepend an entry, dropping the oldest on overflow.
    ///
    /// Returns `false` for an id already in the feed.
    pub fn push(&mut self, entry: ActivityLogEntry) -> bool {
        if self.entries.iter().any(|e| e.id == entry.id) {
            return false;
        }
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
        true
    }

    /// Replace the feed with the newest `capacity` entries of a snapshot.
    pub fn replace(&mut self, mut entries: Vec<ActivityLogEntry>) {
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.entries.clear();
        for entry in entries {
            if self.entries.len() == self.capacity {
                break;
            }
            if !self.entries.iter().any(|e| e.id == entry.id) {
                self.entries.push_back(entry);
            }
        }
    }

    pub fn entries(&self) -> Vec<ActivityLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
struct TelemetryState {
    stats: Option<DashboardStats>,
    feed: ActivityFeed,
}

struct TelemetryInner {
    events: EventBus,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    state: Mutex<TelemetryState>,
}

/// Keeps the admin dashboard current.
pub struct AdminTelemetryRelay {
    inner: Arc<TelemetryInner>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl AdminTelemetryRelay {
    pub fn new(
        config: TelemetryConfig,
        events: EventBus,
        snapshots: Option<Arc<dyn SnapshotSource>>,
    ) -> Self {
        let inner = Arc::new(TelemetryInner {
            events: events.clone(),
            snapshots,
            state: Mutex::new(TelemetryState {
                stats: None,
                feed: ActivityFeed::new(config.activity_capacity),
            }),
        });

        let weak = Arc::downgrade(&inner);
        let on_patch = events.subscribe(EventKind::AdminStatsUpdated, move |event| {
            if let (Some(inner), PlayerEvent::AdminStatsUpdated(patch)) = (weak.upgrade(), event) {
                inner.apply_patch(patch);
            }
        });

        let weak = Arc::downgrade(&inner);
        let on_action = events.subscribe(EventKind::AdminUserAction, move |event| {
            if let (Some(inner), PlayerEvent::AdminUserAction(entry)) = (weak.upgrade(), event) {
                inner.record(entry.clone());
            }
        });

        let weak = Arc::downgrade(&inner);
        let on_resync = events.subscribe(EventKind::ConnectionResync, move |_| {
            spawn_refresh(weak.clone());
        });

        Self {
            inner,
            subscriptions: vec![on_patch, on_action, on_resync],
        }
    }

    /// Replace the stats with an authoritative snapshot.
    ///
    /// A snapshot older than the one already held is ignored.
    pub fn apply_stats_snapshot(&self, stats: DashboardStats) {
        self.inner.apply_snapshot(stats);
    }

    /// Apply a pushed delta. Returns whether the stats changed.
    pub fn apply_stats_patch(&self, patch: &StatsPatch) -> bool {
        self.inner.apply_patch(patch)
    }

    /// Add one entry to the activity feed. Returns `false` for duplicates.
    pub fn record_activity(&self, entry: ActivityLogEntry) -> bool {
        self.inner.record(entry)
    }

    /// Seed the activity feed from the REST log snapshot.
    pub fn apply_logs_snapshot(&self, entries: Vec<ActivityLogEntry>) {
        self.inner.state().feed.replace(entries);
        self.inner.events.publish(PlayerEvent::AdminUpdated);
    }

    /// Fetch both snapshots. Without a snapshot source this does nothing.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        refresh(&self.inner).await
    }

    pub fn stats(&self) -> Option<DashboardStats> {
        self.inner.state().stats.clone()
    }

    /// Activity feed, newest first.
    pub fn activity(&self) -> Vec<ActivityLogEntry> {
        self.inner.state().feed.entries()
    }
}

impl Drop for AdminTelemetryRelay {
    fn drop(&mut self) {
        for handle in self.subscriptions.drain(..) {
            self.inner.events.unsubscribe(handle);
        }
    }
}

impl TelemetryInner {
    fn state(&self) -> MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_snapshot(&self, stats: DashboardStats) {
        {
            let mut state = self.state();
            if let (Some(current), Some(incoming)) =
                (state.stats.as_ref().and_then(|s| s.as_of), stats.as_of)
            {
                if incoming < current {
                    tracing::debug!(as_of = %incoming, held = %current, "Ignoring older stats snapshot");
                    return;
                }
            }
            state.stats = Some(stats);
        }
        self.events.publish(PlayerEvent::AdminUpdated);
    }

    fn apply_patch(&self, patch: &StatsPatch) -> bool {
        let changed = {
            let mut state = self.state();
            let stats = state.stats.get_or_insert_with(DashboardStats::default);
            if stats.supersedes(patch) {
                tracing::debug!(at = ?patch.at, as_of = ?stats.as_of, "Dropping delta older than snapshot");
                return false;
            }
            stats.apply_patch(patch)
        };
        if changed {
            self.events.publish(PlayerEvent::AdminUpdated);
        }
        changed
    }

    fn record(&self, entry: ActivityLogEntry) -> bool {
        let added = self.state().feed.push(entry);
        if added {
            self.events.publish(PlayerEvent::AdminUpdated);
        }
        added
    }
}

async fn refresh(inner: &Arc<TelemetryInner>) -> Result<(), ApiError> {
    let Some(snapshots) = inner.snapshots.clone() else {
        return Ok(());
    };
    let stats = snapshots.admin_stats().await?;
    inner.apply_snapshot(stats);
    let logs = snapshots.admin_logs().await?;
    inner.state().feed.replace(logs);
    inner.events.publish(PlayerEvent::AdminUpdated);
    Ok(())
}

fn spawn_refresh(weak: Weak<TelemetryInner>) {
    let Some(snapshots) = weak.upgrade().and_then(|inner| inner.snapshots.clone()) else {
        return;
    };
    tokio::spawn(async move {
        let stats = snapshots.admin_stats().await;
        let logs = snapshots.admin_logs().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match stats {
            Ok(stats) => inner.apply_snapshot(stats),
            Err(e) => tracing::warn!(error = %e, "Admin stats resync failed"),
        }
        match logs {
            Ok(logs) => {
                inner.state().feed.replace(logs);
                inner.events.publish(PlayerEvent::AdminUpdated);
            }
            Err(e) => tracing::warn!(error = %e, "Admin log resync failed"),
        }
    });
}
