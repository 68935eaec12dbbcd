//! Bounded reconnection with linearly growing backoff.
//!
//! [`ReconnectPolicy::should_retry`] is a pure function of the attempt number,
//! so the session worker only has to count consecutive failures.

use std::time::Duration;

/// Configuration for client-side reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay unit; attempt `n` waits `n × base_delay`. Default: 5 s.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts. Default: 60 s.
    pub max_delay: Duration,
    /// Maximum number of reconnection attempts before giving up. Default: 5.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Decides whether, and after how long, to reconnect.
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    /// Create a policy from the given config.
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// The configured attempt limit.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before reconnection attempt `attempt` (1-based), or `None` once
    /// the attempts are exhausted. Attempt 0 is treated as attempt 1.
    pub fn should_retry(&self, attempt: u32) -> Option<Duration> {
        let attempt = attempt.max(1);
        if attempt > self.config.max_attempts {
            return None;
        }
        Some(self.config.base_delay.saturating_mul(attempt).min(self.config.max_delay))
    }
}
