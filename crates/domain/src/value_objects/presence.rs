//! Presence value objects: who is online, playing, or gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Live status reported by the server for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Playing,
    Offline,
}

/// What a consumer should render for a user.
///
/// `Unknown` is never reported by the server; it is the degraded view used
/// while the connection that produced the last observation is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayStatus {
    Online,
    Playing { server_name: Option<String> },
    Offline,
    Unknown,
}

/// Last known presence of one user.
///
/// Entries are created on first observation and only ever updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub username: String,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playing_server: Option<String>,
}

impl PresenceEntry {
    pub fn new(
        user_id: UserId,
        username: impl Into<String>,
        status: PresenceStatus,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            username: username.into(),
            status,
            last_seen_at: observed_at,
            playing_server: None,
        }
    }

    /// Record a new observation for this user.
    ///
    /// Out-of-order observations (older than the last one applied) are ignored
    /// so a late `user_online` can never overwrite a newer `user_offline`.
    /// Returns whether anything changed.
    pub fn observe(
        &mut self,
        status: PresenceStatus,
        playing_server: Option<String>,
        observed_at: DateTime<Utc>,
    ) -> bool {
        if observed_at < self.last_seen_at {
            return false;
        }

        let playing_server = match status {
            PresenceStatus::Playing => playing_server,
            PresenceStatus::Online | PresenceStatus::Offline => None,
        };

        let changed = self.status != status
            || self.playing_server != playing_server
            || self.last_seen_at != observed_at;

        self.status = status;
        self.playing_server = playing_server;
        self.last_seen_at = observed_at;
        changed
    }

    /// Display status as reported, without any degradation applied.
    pub fn reported_display(&self) -> DisplayStatus {
        match self.status {
            PresenceStatus::Online => DisplayStatus::Online,
            PresenceStatus::Playing => DisplayStatus::Playing {
                server_name: self.playing_server.clone(),
            },
            PresenceStatus::Offline => DisplayStatus::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry() -> PresenceEntry {
        PresenceEntry::new(UserId::from("u1"), "alice", PresenceStatus::Online, Utc::now())
    }

    #[test]
    fn playing_keeps_server_name_and_offline_clears_it() {
        let mut e = entry();
        let t1 = e.last_seen_at + Duration::seconds(1);
        assert!(e.observe(PresenceStatus::Playing, Some("EU-1".into()), t1));
        assert_eq!(
            e.reported_display(),
            DisplayStatus::Playing {
                server_name: Some("EU-1".into())
            }
        );

        let t2 = t1 + Duration::seconds(1);
        assert!(e.observe(PresenceStatus::Offline, Some("EU-1".into()), t2));
        assert_eq!(e.playing_server, None);
        assert_eq!(e.reported_display(), DisplayStatus::Offline);
    }

    #[test]
    fn stale_observation_is_ignored() {
        let mut e = entry();
        let later = e.last_seen_at + Duration::seconds(5);
        e.observe(PresenceStatus::Offline, None, later);

        let earlier = later - Duration::seconds(3);
        assert!(!e.observe(PresenceStatus::Online, None, earlier));
        assert_eq!(e.status, PresenceStatus::Offline);
        assert_eq!(e.last_seen_at, later);
    }

    #[test]
    fn status_uses_lowercase_wire_names() {
        let json = serde_json::to_string(&PresenceStatus::Playing).expect("serialize");
        assert_eq!(json, "\"playing\"");
    }
}
