use dashmap::DashMap;
use flowcore::{FlowError, FlowId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::events::StopReason;
use crate::host::HostServices;
use crate::worklet::FlowWorklet;

/// The worklets of one shard index owned by this process.
pub struct FlowHostShard {
    index: usize,
    stop_token: CancellationToken,
    /// Fired once every worklet of a stopped shard has finished.
    drained: CancellationToken,
    services: Arc<HostServices>,
    worklets: DashMap<FlowId, Arc<FlowWorklet>>,
    create_lock: Mutex<()>,
}

impl FlowHostShard {
    pub(crate) fn new(index: usize, stop_token: CancellationToken, services: Arc<HostServices>) -> Arc<Self> {
        Arc::new(Self {
            index,
            stop_token,
            drained: CancellationToken::new(),
            services,
            worklets: DashMap::new(),
            create_lock: Mutex::new(()),
        })
    }

    /// Placeholder for a shard this process does not own; refuses all work.
    pub(crate) fn stopped(index: usize, services: Arc<HostServices>) -> Arc<Self> {
        let stop_token = CancellationToken::new();
        stop_token.cancel();
        let shard = Self::new(index, stop_token, services);
        shard.drained.cancel();
        shard
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Stopped, with no worklet of this shard still running.
    pub fn is_drained(&self) -> bool {
        self.drained.is_cancelled()
    }

    pub async fn wait_drained(&self) {
        self.drained.cancelled().await;
    }

    pub fn worklet_count(&self) -> usize {
        self.worklets.len()
    }

    pub fn get(&self, flow_id: &FlowId) -> Option<Arc<FlowWorklet>> {
        self.worklets.get(flow_id).map(|entry| entry.value().clone())
    }

    /// Returns the worklet for `flow_id`, creating it if needed.
    pub fn worklet(self: &Arc<Self>, flow_id: &FlowId) -> Result<Arc<FlowWorklet>, FlowError> {
        if let Some(worklet) = self.get(flow_id) {
            return Ok(worklet);
        }

        let _guard = self.create_lock.lock();
        if let Some(worklet) = self.get(flow_id) {
            return Ok(worklet);
        }
        if self.is_stopping() {
            return Err(FlowError::WrongShard { shard: self.index });
        }
        let worklet = FlowWorklet::start(flow_id.clone(), self, self.services.clone());
        self.worklets.insert(flow_id.clone(), worklet.clone());
        Ok(worklet)
    }

    /// Removes `worklet` unless another one already replaced it.
    pub(crate) fn remove_worklet(&self, worklet: &Arc<FlowWorklet>) {
        self.worklets
            .remove_if(worklet.flow_id(), |_, current| Arc::ptr_eq(current, worklet));
    }

    /// Stops the shard and waits until every worklet has drained.
    pub(crate) async fn stop(&self, reason: StopReason) {
        let worklets: Vec<Arc<FlowWorklet>> = {
            let _guard = self.create_lock.lock();
            for entry in self.worklets.iter() {
                entry.value().dispose_with(reason);
            }
            self.stop_token.cancel();
            self.worklets.iter().map(|entry| entry.value().clone()).collect()
        };

        tracing::debug!(shard = self.index, worklets = worklets.len(), "Stopping shard");
        futures::future::join_all(worklets.iter().map(|worklet| worklet.wait_stopped())).await;
        self.drained.cancel();
    }
}

impl std::fmt::Debug for FlowHostShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHostShard")
            .field("index", &self.index)
            .field("stopping", &self.is_stopping())
            .field("drained", &self.is_drained())
            .field("worklets", &self.worklets.len())
            .finish()
    }
}
