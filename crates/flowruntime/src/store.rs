use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowcore::{steps, FlowError, FlowEventEnvelope, FlowId, ScheduledEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The persisted form of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFlow {
    pub version: u64,
    pub step: String,
    pub hard_resume_at: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
}

impl StoredFlow {
    /// A flow that was never started.
    pub fn starting() -> Self {
        Self {
            version: 0,
            step: steps::STARTING.to_string(),
            hard_resume_at: None,
            data: serde_json::Value::Null,
        }
    }
}

/// Durable flow storage used by worklets.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredFlow>, FlowError>;

    /// Writes `flow` (or deletes the flow when `None`) if the stored version
    /// equals `expected_version`, and returns the new version. `events` are
    /// scheduled for later delivery in the same write.
    async fn save(
        &self,
        flow_id: &FlowId,
        expected_version: u64,
        flow: Option<StoredFlow>,
        events: Vec<ScheduledEvent>,
    ) -> Result<u64, FlowError>;

    /// Loads the flow, or persists and returns a fresh one.
    async fn get_or_start(&self, flow_id: &FlowId) -> Result<StoredFlow, FlowError> {
        if let Some(flow) = self.load(flow_id).await? {
            return Ok(flow);
        }
        let fresh = StoredFlow::starting();
        let version = self.save(flow_id, 0, Some(fresh.clone()), Vec::new()).await?;
        Ok(StoredFlow { version, ..fresh })
    }
}

/// In-process [`FlowStore`]; also keeps the scheduled event outbox.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: DashMap<FlowId, StoredFlow>,
    scheduled: Mutex<Vec<ScheduledEvent>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flow_id: &FlowId) -> Option<StoredFlow> {
        self.flows.get(flow_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Removes and returns the scheduled events due at `now`, oldest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<FlowEventEnvelope> {
        let mut scheduled = self.scheduled.lock();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            scheduled.drain(..).partition(|event| event.due_at <= now);
        *scheduled = pending;
        due.sort_by_key(|event| event.due_at);
        due.into_iter().map(|event| event.envelope).collect()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn load(&self, flow_id: &FlowId) -> Result<Option<StoredFlow>, FlowError> {
        Ok(self.get(flow_id))
    }

    async fn save(
        &self,
        flow_id: &FlowId,
        expected_version: u64,
        flow: Option<StoredFlow>,
        events: Vec<ScheduledEvent>,
    ) -> Result<u64, FlowError> {
        let version = match (self.flows.entry(flow_id.clone()), flow) {
            (dashmap::mapref::entry::Entry::Vacant(_), None) => 0,
            (dashmap::mapref::entry::Entry::Vacant(entry), Some(flow)) => {
                if expected_version != 0 {
                    return Err(FlowError::VersionMismatch {
                        flow_id: flow_id.clone(),
                        expected: expected_version,
                        actual: 0,
                    });
                }
                entry.insert(StoredFlow { version: 0, ..flow });
                0
            }
            (dashmap::mapref::entry::Entry::Occupied(entry), flow) => {
                let actual = entry.get().version;
                if actual != expected_version {
                    return Err(FlowError::VersionMismatch {
                        flow_id: flow_id.clone(),
                        expected: expected_version,
                        actual,
                    });
                }
                let version = actual + 1;
                match flow {
                    Some(flow) => {
                        let mut entry = entry;
                        *entry.get_mut() = StoredFlow { version, ..flow };
                    }
                    None => {
                        entry.remove();
                    }
                }
                version
            }
        };

        if !events.is_empty() {
            self.scheduled.lock().extend(events);
        }
        Ok(version)
    }
}
