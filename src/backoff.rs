//! Retry timing for upstream calls.
//!
//! Every component that talks to a remote service (embedding, chat, web
//! search, object store) is handed a [`BackoffPolicy`] instead of sleeping
//! on its own schedule. The policy is exponential with full jitter, capped
//! at `max_delay`.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts = 1 initial + `max_retries` retries.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// When set, each delay is drawn uniformly from `[base/2, delay]`.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry `attempt` (1-based). Attempt 0 is the initial
    /// call and has no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let capped = raw.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let floor = self.base_delay / 2;
        if capped <= floor {
            return capped;
        }
        let span = (capped - floor).as_millis() as u64;
        let offset = rand::thread_rng().gen_range(0..=span);
        floor + Duration::from_millis(offset)
    }

    /// Sleep for the delay associated with retry `attempt`.
    pub async fn wait(&self, attempt: u32) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
