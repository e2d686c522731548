// Reconnect delay policy: base × 2^attempt, capped, plus random jitter

use rand::Rng;
use std::time::Duration;

use crate::config::SseConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_jitter: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_jitter: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            cap: cap.max(base),
            max_jitter,
            max_attempts,
        }
    }

    pub fn from_config(config: &SseConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_millis(config.max_jitter_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Deterministic part of the delay; non-decreasing in `attempt`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// No more attempts allowed once `attempt` reaches the maximum
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
