use flowcore::{FlowError, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Configuration for the flow host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Fixed number of shards the flow id space is split into.
    pub shard_count: usize,
    /// How events are re-routed after their worklet was torn down.
    pub retry: RetryPolicy,
    pub event_buffer_size: usize,
}

impl HostConfig {
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        let config: HostConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.shard_count == 0 {
            return Err(FlowError::Internal("shard_count must be positive".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(FlowError::Internal(
                "retry.max_delay_ms must not be below retry.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            retry: RetryPolicy::default(),
            event_buffer_size: 1000,
        }
    }
}
