//! Admin dashboard telemetry: stats snapshot, push deltas, and activity entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ActivityId;

/// Severity of an admin activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Info,
    Success,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

/// One line of the admin live-activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub id: ActivityId,
    pub action: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub level: ActivityLevel,
}

/// Authoritative dashboard counters, as returned by the REST snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_users: u64,
    pub online_users: u64,
    pub active_servers: u64,
    pub open_tickets: u64,
    pub forum_posts_today: u64,
    pub store_revenue_cents: i64,
    /// Server time the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

/// Incremental update pushed over the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsPatch {
    #[serde(default)]
    pub total_users: Option<u64>,
    #[serde(default)]
    pub online_users: Option<u64>,
    #[serde(default)]
    pub active_servers: Option<u64>,
    #[serde(default)]
    pub open_tickets: Option<u64>,
    #[serde(default)]
    pub forum_posts_today: Option<u64>,
    #[serde(default)]
    pub store_revenue_cents: Option<i64>,
    /// Server time the delta was produced.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

impl DashboardStats {
    /// Whether a delta was produced before this snapshot and is already
    /// reflected in it.
    pub fn supersedes(&self, patch: &StatsPatch) -> bool {
        match (self.as_of, patch.at) {
            (Some(as_of), Some(at)) => at < as_of,
            _ => false,
        }
    }

    /// Apply the fields present in `patch`. Returns whether anything changed.
    pub fn apply_patch(&mut self, patch: &StatsPatch) -> bool {
        let before = self.clone();

        if let Some(v) = patch.total_users {
            self.total_users = v;
        }
        if let Some(v) = patch.online_users {
            self.online_users = v;
        }
        if let Some(v) = patch.active_servers {
            self.active_servers = v;
        }
        if let Some(v) = patch.open_tickets {
            self.open_tickets = v;
        }
        if let Some(v) = patch.forum_posts_today {
            self.forum_posts_today = v;
        }
        if let Some(v) = patch.store_revenue_cents {
            self.store_revenue_cents = v;
        }

        *self != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn patch_only_touches_present_fields() {
        let mut stats = DashboardStats {
            total_users: 100,
            online_users: 10,
            ..Default::default()
        };
        let patch = StatsPatch {
            online_users: Some(12),
            ..Default::default()
        };

        assert!(stats.apply_patch(&patch));
        assert_eq!(stats.total_users, 100);
        assert_eq!(stats.online_users, 12);
        assert!(!stats.apply_patch(&patch));
    }

    #[test]
    fn older_delta_is_superseded_by_snapshot() {
        let now = Utc::now();
        let stats = DashboardStats {
            as_of: Some(now),
            ..Default::default()
        };
        let old = StatsPatch {
            at: Some(now - Duration::seconds(1)),
            ..Default::default()
        };
        let new = StatsPatch {
            at: Some(now + Duration::seconds(1)),
            ..Default::default()
        };

        assert!(stats.supersedes(&old));
        assert!(!stats.supersedes(&new));
    }

    #[test]
    fn level_accepts_warn_alias() {
        let level: ActivityLevel = serde_json::from_str("\"warn\"").expect("deserialize");
        assert_eq!(level, ActivityLevel::Warning);
    }
}
