use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-flow-type runtime options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowOptions {
    /// How long an idle worklet stays alive before it is evicted.
    pub keep_alive_ms: u64,
    /// Delay between `OnEnding` and the final `OnEnd`.
    pub remove_delay_ms: u64,
    /// Grace window for the in-flight event once the worklet is told to stop.
    pub graceful_dispose_timeout_ms: u64,
}

impl FlowOptions {
    pub fn keep_alive_for(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn remove_delay(&self) -> Duration {
        Duration::from_millis(self.remove_delay_ms)
    }

    pub fn graceful_dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_dispose_timeout_ms)
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_ms = keep_alive.as_millis() as u64;
        self
    }

    pub fn with_remove_delay(mut self, remove_delay: Duration) -> Self {
        self.remove_delay_ms = remove_delay.as_millis() as u64;
        self
    }

    pub fn with_graceful_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_dispose_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            keep_alive_ms: 30_000,
            remove_delay_ms: 10_000,
            graceful_dispose_timeout_ms: 5_000,
        }
    }
}

/// Retry policy for re-routing an event after its worklet was torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// `None` retries until the caller cancels.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}
