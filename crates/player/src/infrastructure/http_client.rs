//! REST snapshot client
//!
//! Implements the SnapshotSource port against the launcher's HTTP API. Every
//! request carries the session token as a bearer credential.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use launchpad_domain::{ActivityLogEntry, ChatId, ChatMessage, DashboardStats, PresenceEntry};

use crate::ports::outbound::{ApiError, SnapshotSource};

/// Client for the launcher's snapshot endpoints
#[derive(Clone)]
pub struct HttpSnapshotSource {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpSnapshotSource {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::RequestFailed(format!("invalid base url: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    /// Build `<base>/api/<segments...>`, escaping each segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::RequestFailed("base url cannot have a path".to_string()))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        tracing::debug!(url = %url, "Fetching snapshot");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn chat_history(&self, chat_id: &ChatId) -> Result<Vec<ChatMessage>, ApiError> {
        let url = self.endpoint(&["chats", chat_id.as_str(), "messages"])?;
        self.get_json(url).await
    }

    async fn presence_snapshot(&self) -> Result<Vec<PresenceEntry>, ApiError> {
        let url = self.endpoint(&["friends", "presence"])?;
        self.get_json(url).await
    }

    async fn admin_stats(&self) -> Result<DashboardStats, ApiError> {
        let url = self.endpoint(&["admin", "stats"])?;
        self.get_json(url).await
    }

    async fn admin_logs(&self) -> Result<Vec<ActivityLogEntry>, ApiError> {
        let url = self.endpoint(&["admin", "logs"])?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_built_under_api() {
        let source = HttpSnapshotSource::new("http://localhost:3000/", "t").expect("client");

        let url = source.endpoint(&["friends", "presence"]).expect("url");
        assert_eq!(url.as_str(), "http://localhost:3000/api/friends/presence");
    }

    #[test]
    fn chat_ids_are_escaped() {
        let source = HttpSnapshotSource::new("https://launcher.example.com", "t").expect("client");

        let url = source
            .endpoint(&["chats", "team/alpha", "messages"])
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://launcher.example.com/api/chats/team%2Falpha/messages"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            HttpSnapshotSource::new("not a url", "t"),
            Err(ApiError::RequestFailed(_))
        ));
    }
}
