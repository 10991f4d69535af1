use chrono::{DateTime, Utc};
use flowcore::FlowId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a worklet stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Idle,
    Disposed,
    ShardLost,
    Ended,
    Failed,
}

/// Lifecycle events emitted by the flow host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    WorkletStarted {
        flow_id: FlowId,
        shard: usize,
        timestamp: DateTime<Utc>,
    },
    EventProcessed {
        flow_id: FlowId,
        event: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        flow_id: FlowId,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    FlowEnded {
        flow_id: FlowId,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    WorkletStopped {
        flow_id: FlowId,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },
    ShardAcquired {
        shard: usize,
        timestamp: DateTime<Utc>,
    },
    ShardReleased {
        shard: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Host-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
