//! Realtime configuration.
//!
//! Every tunable has a default; `from_env` overlays `LAUNCHPAD_*` variables.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::infrastructure::websocket::core::{
    ReconnectPolicy, BACKOFF_MULTIPLIER, INITIAL_RETRY_DELAY_MS, JITTER_RATIO,
    MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid URL for {key}: {reason}")]
    InvalidUrl { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub ws_url: String,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_retry_attempts: u32,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
    /// Capacity of the outbound command queue
    pub outbound_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3000/ws".to_string(),
            heartbeat_interval_ms: 15_000,
            pong_timeout_ms: 10_000,
            initial_retry_delay_ms: INITIAL_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_RETRY_DELAY_MS,
            max_retry_attempts: MAX_RETRY_ATTEMPTS,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            jitter_ratio: JITTER_RATIO,
            outbound_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            max_attempts: self.max_retry_attempts,
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// How long a send/edit/delete may wait for its server ack
    pub ack_timeout_ms: u64,
    /// Typing indicators expire after this window without a stop
    pub typing_timeout_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            typing_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub activity_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            activity_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub chat: ChatConfig,
    pub telemetry: TelemetryConfig,
    pub api_base_url: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            chat: ChatConfig::default(),
            telemetry: TelemetryConfig::default(),
            api_base_url: "http://localhost:3000".to_string(),
        }
    }
}

impl RealtimeConfig {
    /// Defaults overlaid with `LAUNCHPAD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("LAUNCHPAD_WS_URL") {
            config.connection.ws_url = url;
        }
        if let Some(url) = lookup("LAUNCHPAD_API_URL") {
            config.api_base_url = url;
        }

        let conn = &mut config.connection;
        overlay(&lookup, "LAUNCHPAD_HEARTBEAT_INTERVAL_MS", &mut conn.heartbeat_interval_ms)?;
        overlay(&lookup, "LAUNCHPAD_PONG_TIMEOUT_MS", &mut conn.pong_timeout_ms)?;
        overlay(&lookup, "LAUNCHPAD_INITIAL_RETRY_DELAY_MS", &mut conn.initial_retry_delay_ms)?;
        overlay(&lookup, "LAUNCHPAD_MAX_RETRY_DELAY_MS", &mut conn.max_retry_delay_ms)?;
        overlay(&lookup, "LAUNCHPAD_MAX_RETRY_ATTEMPTS", &mut conn.max_retry_attempts)?;
        overlay(&lookup, "LAUNCHPAD_BACKOFF_MULTIPLIER", &mut conn.backoff_multiplier)?;
        overlay(&lookup, "LAUNCHPAD_JITTER_RATIO", &mut conn.jitter_ratio)?;
        overlay(&lookup, "LAUNCHPAD_OUTBOUND_BUFFER", &mut conn.outbound_buffer)?;
        overlay(&lookup, "LAUNCHPAD_ACK_TIMEOUT_MS", &mut config.chat.ack_timeout_ms)?;
        overlay(&lookup, "LAUNCHPAD_TYPING_TIMEOUT_MS", &mut config.chat.typing_timeout_ms)?;
        overlay(
            &lookup,
            "LAUNCHPAD_ACTIVITY_CAPACITY",
            &mut config.telemetry.activity_capacity,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("LAUNCHPAD_WS_URL", &self.connection.ws_url, &["ws", "wss"])?;
        check_url("LAUNCHPAD_API_URL", &self.api_base_url, &["http", "https"])?;

        if !(0.0..=1.0).contains(&self.connection.jitter_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "LAUNCHPAD_JITTER_RATIO",
                value: self.connection.jitter_ratio.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }
        if self.connection.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "LAUNCHPAD_BACKOFF_MULTIPLIER",
                value: self.connection.backoff_multiplier.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.telemetry.activity_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LAUNCHPAD_ACTIVITY_CAPACITY",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn overlay<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    Ok(())
}

fn check_url(key: &'static str, raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        key,
        reason: e.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            key,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = RealtimeConfig::from_lookup(lookup(&[])).expect("defaults are valid");
        assert_eq!(config, RealtimeConfig::default());
        assert_eq!(config.connection.heartbeat_interval_ms, 15_000);
        assert_eq!(config.chat.typing_timeout_ms, 3_000);
        assert_eq!(config.telemetry.activity_capacity, 10);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = RealtimeConfig::from_lookup(lookup(&[
            ("LAUNCHPAD_WS_URL", "wss://play.example.com/ws"),
            ("LAUNCHPAD_MAX_RETRY_ATTEMPTS", "3"),
            ("LAUNCHPAD_TYPING_TIMEOUT_MS", " 5000 "),
        ]))
        .expect("valid overrides");

        assert_eq!(config.connection.ws_url, "wss://play.example.com/ws");
        assert_eq!(config.connection.max_retry_attempts, 3);
        assert_eq!(config.chat.typing_timeout_ms, 5_000);
        assert_eq!(config.connection.reconnect_policy().max_attempts, 3);
    }

    #[test]
    fn unparsable_number_is_rejected() {
        let err = RealtimeConfig::from_lookup(lookup(&[("LAUNCHPAD_ACK_TIMEOUT_MS", "soon")]))
            .expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "LAUNCHPAD_ACK_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn http_url_is_not_a_socket_url() {
        let err = RealtimeConfig::from_lookup(lookup(&[("LAUNCHPAD_WS_URL", "http://x/ws")]))
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn jitter_out_of_range_is_rejected() {
        let err = RealtimeConfig::from_lookup(lookup(&[("LAUNCHPAD_JITTER_RATIO", "1.5")]))
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
