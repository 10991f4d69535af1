use chrono::Utc;
use flowcore::{FlowError, FlowEvent, FlowId, FlowRegistry};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::events::{EventBus, HostEvent, StopReason};
use crate::shard::FlowHostShard;
use crate::store::FlowStore;
use crate::timeouts::Timeouts;
use crate::worklet::FlowWorklet;

/// Collaborators shared by the host, its shards and their worklets.
pub(crate) struct HostServices {
    pub(crate) registry: Arc<FlowRegistry>,
    pub(crate) store: Arc<dyn FlowStore>,
    pub(crate) timeouts: Arc<Timeouts>,
    pub(crate) events: EventBus,
}

enum ShardSlot {
    Installed(Arc<FlowHostShard>),
    /// The slot still holds a stopped shard whose worklets are finishing.
    Draining(Arc<FlowHostShard>),
}

/// Entry point of the runtime: routes events to the worklet owning their
/// flow, across shard ownership changes.
///
/// Every shard starts out stopped; ownership is granted through
/// [`FlowHost::run_shard`] (or [`FlowHost::run_all_shards`] in a single
/// process). Events for a shard this process does not own are retried until
/// it is acquired or the caller gives up.
///
/// Delivery is at least once: an event whose worklet was torn down mid-step
/// is re-run against the last persisted state of the flow.
pub struct FlowHost {
    config: HostConfig,
    services: Arc<HostServices>,
    shards: RwLock<Vec<Arc<FlowHostShard>>>,
    stop_token: CancellationToken,
}

impl FlowHost {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: HostConfig,
        registry: Arc<FlowRegistry>,
        store: Arc<dyn FlowStore>,
    ) -> Result<Arc<Self>, FlowError> {
        config.validate()?;
        let services = Arc::new(HostServices {
            registry,
            store,
            timeouts: Timeouts::start(),
            events: EventBus::new(config.event_buffer_size),
        });
        let shards = (0..config.shard_count)
            .map(|index| FlowHostShard::stopped(index, services.clone()))
            .collect();

        tracing::info!(shards = config.shard_count, "Flow host created");
        Ok(Arc::new(Self {
            config,
            services,
            shards: RwLock::new(shards),
            stop_token: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.services.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.services.events.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    pub fn shard_index(&self, flow_id: &FlowId) -> usize {
        flow_id.shard_index(self.config.shard_count)
    }

    pub fn is_shard_owned(&self, index: usize) -> bool {
        self.shard(index).map_or(false, |shard| !shard.is_stopping())
    }

    pub fn worklet_count(&self) -> usize {
        self.shards.read().iter().map(|shard| shard.worklet_count()).sum()
    }

    fn shard(&self, index: usize) -> Option<Arc<FlowHostShard>> {
        self.shards.read().get(index).cloned()
    }

    /// Returns the live worklet for `flow_id`, creating it on demand.
    pub fn worklet(&self, flow_id: &FlowId) -> Result<Arc<FlowWorklet>, FlowError> {
        if self.is_disposed() {
            return Err(FlowError::AlreadyDisposed);
        }
        self.services.registry.flow_type(flow_id.name())?;

        let index = self.shard_index(flow_id);
        let shard = self
            .shard(index)
            .ok_or(FlowError::WrongShard { shard: index })?;
        shard.worklet(flow_id)
    }

    /// Delivers `event` to its flow and returns the resulting flow version.
    ///
    /// Routing failures caused by shard churn are retried according to the
    /// configured [`flowcore::RetryPolicy`]; `cancellation` aborts the wait
    /// at any point.
    pub async fn process_event(
        &self,
        flow_id: &FlowId,
        event: FlowEvent,
        cancellation: CancellationToken,
    ) -> Result<u64, FlowError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        loop {
            let (worklet, result) = match self.worklet(flow_id) {
                Ok(worklet) => {
                    let pending = worklet.handle_event(event.clone(), cancellation.clone());
                    let result = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => return Err(FlowError::Cancelled),
                        result = pending => result,
                    };
                    (Some(worklet), result)
                }
                Err(error) => (None, Err(error)),
            };

            let error = match result {
                Ok(version) => return Ok(version),
                Err(error) => error,
            };
            let worklet_stopping = worklet.as_ref().map_or(false, |worklet| worklet.is_stopping());
            let retryable = error.is_retryable_routing() && (!error.is_cancellation() || worklet_stopping);
            if !retryable || self.is_disposed() || !retry.allows(attempt) {
                return Err(error);
            }

            if let Some(worklet) = worklet {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(FlowError::Cancelled),
                    _ = worklet.wait_stopped() => {}
                }
            }
            let delay = retry.delay(attempt);
            tracing::debug!(flow_id = %flow_id, attempt, error = %error, ?delay, "Retrying event delivery");
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(FlowError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Ownership hook for an external shard-leasing service: the shard is
    /// served until `lease` is cancelled (or the host is disposed), then
    /// drained.
    ///
    /// If a previous owner of `index` is still draining, the shard is only
    /// installed once every worklet of that owner has stopped.
    pub async fn run_shard(&self, index: usize, lease: CancellationToken) -> Result<(), FlowError> {
        let shard = tokio::select! {
            biased;
            _ = lease.cancelled() => return Ok(()),
            shard = self.acquire_shard(index) => shard?,
        };
        self.hold_shard(shard, lease).await;
        Ok(())
    }

    /// Owns every shard; returns one task per shard. Shards that are free
    /// are installed before this returns.
    pub fn run_all_shards(
        self: &Arc<Self>,
        lease: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, FlowError> {
        let mut tasks = Vec::with_capacity(self.config.shard_count);
        for index in 0..self.config.shard_count {
            let host = self.clone();
            let lease = lease.clone();
            let task = match self.try_acquire_shard(index)? {
                ShardSlot::Installed(shard) => tokio::spawn(async move { host.hold_shard(shard, lease).await }),
                ShardSlot::Draining(_) => tokio::spawn(async move {
                    if let Err(error) = host.run_shard(index, lease).await {
                        tracing::warn!(shard = index, error = %error, "Failed to acquire shard");
                    }
                }),
            };
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn acquire_shard(&self, index: usize) -> Result<Arc<FlowHostShard>, FlowError> {
        loop {
            let previous = match self.try_acquire_shard(index)? {
                ShardSlot::Installed(shard) => return Ok(shard),
                ShardSlot::Draining(previous) => previous,
            };
            tracing::debug!(shard = index, "Waiting for the previous owner to drain");
            tokio::select! {
                _ = self.stop_token.cancelled() => return Err(FlowError::AlreadyDisposed),
                _ = previous.wait_drained() => {}
            }
        }
    }

    fn try_acquire_shard(&self, index: usize) -> Result<ShardSlot, FlowError> {
        if self.is_disposed() {
            return Err(FlowError::AlreadyDisposed);
        }
        if index >= self.config.shard_count {
            return Err(FlowError::Internal(format!(
                "shard {} is out of range (shard count is {})",
                index, self.config.shard_count
            )));
        }

        let shard = {
            let mut shards = self.shards.write();
            let current = &shards[index];
            if !current.is_stopping() {
                return Err(FlowError::Internal(format!("shard {} is already owned", index)));
            }
            if !current.is_drained() {
                return Ok(ShardSlot::Draining(current.clone()));
            }
            let shard = FlowHostShard::new(index, self.stop_token.child_token(), self.services.clone());
            shards[index] = shard.clone();
            shard
        };

        tracing::info!(shard = index, "Shard acquired");
        self.services.events.emit(HostEvent::ShardAcquired {
            shard: index,
            timestamp: Utc::now(),
        });
        Ok(ShardSlot::Installed(shard))
    }

    async fn hold_shard(&self, shard: Arc<FlowHostShard>, lease: CancellationToken) {
        let index = shard.index();
        let reason = tokio::select! {
            _ = lease.cancelled() => StopReason::ShardLost,
            _ = shard.stop_token().cancelled() => StopReason::Disposed,
        };

        shard.stop(reason).await;
        {
            let mut shards = self.shards.write();
            if Arc::ptr_eq(&shards[index], &shard) {
                shards[index] = FlowHostShard::stopped(index, self.services.clone());
            }
        }

        tracing::info!(shard = index, ?reason, "Shard released");
        self.services.events.emit(HostEvent::ShardReleased {
            shard: index,
            timestamp: Utc::now(),
        });
    }

    /// Stops the host: every shard is drained and later calls fail with
    /// `AlreadyDisposed`.
    pub async fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        tracing::info!("Disposing flow host");
        self.stop_token.cancel();

        let shards: Vec<Arc<FlowHostShard>> = self.shards.read().clone();
        futures::future::join_all(shards.iter().map(|shard| shard.stop(StopReason::Disposed))).await;
        self.services.timeouts.shutdown();
    }
}

impl std::fmt::Debug for FlowHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHost")
            .field("shards", &self.config.shard_count)
            .field("worklets", &self.worklet_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
