//! Platform-agnostic reconnection math for the realtime connection.
//!
//! Free of any runtime dependency; the connection manager owns the sleeping and
//! asks this module how long to wait before each attempt.

use std::time::Duration;

use rand::Rng;

// Defaults kept in one place so config and tests agree
pub const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const BACKOFF_MULTIPLIER: f64 = 2.0;
pub const JITTER_RATIO: f64 = 0.2;

/// Reconnect policy: exponential backoff with jitter, capped delay, bounded
/// attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± jitter_ratio`
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: INITIAL_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            max_attempts: MAX_RETRY_ATTEMPTS,
            multiplier: BACKOFF_MULTIPLIER,
            jitter_ratio: JITTER_RATIO,
        }
    }
}

/// Exponential backoff state for one reconnect cycle.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: ReconnectPolicy,
    attempts: u32,
    delay_ms: u64,
}

impl BackoffState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let delay_ms = policy.initial_delay_ms;
        Self {
            policy,
            attempts: 0,
            delay_ms,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay_ms = self.policy.initial_delay_ms;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Advance to the next attempt.
    ///
    /// Returns the (jittered) delay to wait *before* performing this attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay_and_advance(&mut self) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with(&mut self, rng: &mut impl Rng) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base = self.delay_ms;
        self.attempts += 1;
        self.delay_ms = ((self.delay_ms as f64) * self.policy.multiplier)
            .min(self.policy.max_delay_ms as f64) as u64;

        let jitter = self.policy.jitter_ratio.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let jittered = ((base as f64) * factor).min(self.policy.max_delay_ms as f64);
        Some(Duration::from_millis(jittered.max(0.0) as u64))
    }
}
