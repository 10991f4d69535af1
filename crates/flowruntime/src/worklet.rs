use chrono::Utc;
use flowcore::{FlowError, FlowEvent, FlowId, FlowInstance, FlowOptions, FlowTransition};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::events::{HostEvent, StopReason};
use crate::host::HostServices;
use crate::shard::FlowHostShard;
use crate::store::StoredFlow;
use crate::timeouts::TimeoutHandler;

struct QueueEntry {
    event: FlowEvent,
    cancellation: CancellationToken,
    reply: oneshot::Sender<Result<u64, FlowError>>,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<QueueEntry>,
    closed: bool,
    /// The run loop is parked waiting for work.
    idle: bool,
}

/// The actor owning one flow: every event addressed to `flow_id` is
/// processed here, one at a time, in arrival order.
pub struct FlowWorklet {
    me: Weak<FlowWorklet>,
    flow_id: FlowId,
    shard_index: usize,
    shard: Weak<FlowHostShard>,
    services: Arc<HostServices>,
    inbox: Mutex<Inbox>,
    ready: Notify,
    stop_token: CancellationToken,
    hard_stop: CancellationToken,
    stopped: CancellationToken,
    timeout_key: u64,
    grace: Mutex<Duration>,
    stop_reason: Mutex<Option<StopReason>>,
}

impl FlowWorklet {
    /// Creates the worklet and spawns its run loop.
    pub(crate) fn start(flow_id: FlowId, shard: &Arc<FlowHostShard>, services: Arc<HostServices>) -> Arc<Self> {
        let worklet = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            flow_id,
            shard_index: shard.index(),
            shard: Arc::downgrade(shard),
            timeout_key: services.timeouts.next_key(),
            services,
            inbox: Mutex::new(Inbox::default()),
            ready: Notify::new(),
            stop_token: shard.stop_token().child_token(),
            hard_stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
            grace: Mutex::new(FlowOptions::default().graceful_dispose_timeout()),
            stop_reason: Mutex::new(None),
        });

        tracing::debug!(flow_id = %worklet.flow_id, shard = worklet.shard_index, "Worklet started");
        worklet.services.events.emit(HostEvent::WorkletStarted {
            flow_id: worklet.flow_id.clone(),
            shard: worklet.shard_index,
            timestamp: Utc::now(),
        });
        tokio::spawn(worklet.clone().watch_stop());
        tokio::spawn(worklet.clone().run());
        worklet
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// Queues `event` and returns a future resolving to the flow version once
    /// this event (and any steps it chained) has been processed.
    ///
    /// The event is queued before this returns, so calls made one after
    /// another are processed in that order even if their futures are polled
    /// later. A closed worklet fails the future with `ChannelClosed`.
    pub fn handle_event(
        &self,
        event: FlowEvent,
        cancellation: CancellationToken,
    ) -> impl Future<Output = Result<u64, FlowError>> + Send + 'static {
        let (reply, receiver) = oneshot::channel();
        let flow_id = self.flow_id.clone();
        let enqueued = {
            let mut inbox = self.inbox.lock();
            if inbox.closed {
                Err(FlowError::ChannelClosed(flow_id.clone()))
            } else {
                inbox.queue.push_back(QueueEntry {
                    event,
                    cancellation,
                    reply,
                });
                Ok(())
            }
        };
        if enqueued.is_ok() {
            self.ready.notify_one();
        }

        async move {
            enqueued?;
            receiver
                .await
                .map_err(|_| FlowError::ChannelClosed(flow_id))?
        }
    }

    /// Begins a graceful stop: no new events are accepted, and the event in
    /// flight gets the flow's graceful dispose timeout to finish.
    pub fn dispose(&self) {
        self.dispose_with(StopReason::Disposed);
    }

    pub(crate) fn dispose_with(&self, reason: StopReason) {
        self.set_stop_reason(reason);
        self.stop_token.cancel();
    }

    pub async fn dispose_and_wait(&self) {
        self.dispose();
        self.wait_stopped().await;
    }

    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await;
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled() || self.inbox.lock().closed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    fn set_stop_reason(&self, reason: StopReason) {
        self.stop_reason.lock().get_or_insert(reason);
    }

    fn close_inbox(&self) {
        self.inbox.lock().closed = true;
        self.ready.notify_one();
    }

    async fn watch_stop(self: Arc<Self>) {
        tokio::select! {
            _ = self.stopped.cancelled() => return,
            _ = self.stop_token.cancelled() => {}
        }
        self.close_inbox();

        let grace = *self.grace.lock();
        tokio::select! {
            _ = self.stopped.cancelled() => {}
            _ = tokio::time::sleep(grace) => {
                tracing::debug!(flow_id = %self.flow_id, "Graceful stop timed out, cancelling in-flight step");
                self.hard_stop.cancel();
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let loaded = tokio::select! {
            loaded = self.load() => loaded,
            _ = self.hard_stop.cancelled() => Err(FlowError::Cancelled),
        };

        let reason = match loaded {
            Ok(flow) => {
                *self.grace.lock() = flow.options().graceful_dispose_timeout();
                self.process(flow).await
            }
            Err(error) if error.is_cancellation() => StopReason::Disposed,
            Err(error) => {
                tracing::error!(flow_id = %self.flow_id, error = %error, "Failed to load flow");
                let pending = {
                    let mut inbox = self.inbox.lock();
                    inbox.closed = true;
                    std::mem::take(&mut inbox.queue)
                };
                for entry in pending {
                    let _ = entry
                        .reply
                        .send(Err(FlowError::Internal(format!("failed to load `{}`: {}", self.flow_id, error))));
                }
                StopReason::Failed
            }
        };
        self.on_stop(reason);
    }

    async fn load(&self) -> Result<FlowInstance, FlowError> {
        let stored = self.services.store.get_or_start(&self.flow_id).await?;
        self.services.registry.restore(
            &self.flow_id,
            stored.version,
            &stored.step,
            stored.hard_resume_at,
            stored.data,
        )
    }

    async fn process(&self, mut flow: FlowInstance) -> StopReason {
        let keep_alive = flow.options().keep_alive_for();
        while let Some(entry) = self.next_entry(keep_alive).await {
            if let Some(reason) = self.handle_entry(&mut flow, entry).await {
                return reason;
            }
        }
        StopReason::Disposed
    }

    /// Waits for the next entry; `None` once the inbox is closed. While
    /// parked the worklet is armed for idle eviction.
    async fn next_entry(&self, keep_alive: Duration) -> Option<QueueEntry> {
        loop {
            {
                let mut inbox = self.inbox.lock();
                if inbox.closed {
                    return None;
                }
                if let Some(entry) = inbox.queue.pop_front() {
                    inbox.idle = false;
                    return Some(entry);
                }
                inbox.idle = true;
            }

            let handler: Weak<dyn TimeoutHandler> = self.me.clone();
            self.services
                .timeouts
                .add_or_update_to_later(self.timeout_key, handler, tokio::time::Instant::now() + keep_alive);
            self.ready.notified().await;
            self.services.timeouts.remove(self.timeout_key);
        }
    }

    /// Processes one entry; returns a stop reason when the run loop must end.
    async fn handle_entry(&self, flow: &mut FlowInstance, entry: QueueEntry) -> Option<StopReason> {
        let QueueEntry {
            event,
            cancellation,
            reply,
        } = entry;

        if cancellation.is_cancelled() {
            let _ = reply.send(Err(FlowError::Cancelled));
            return None;
        }
        if self.stop_token.is_cancelled() {
            let _ = reply.send(Err(FlowError::ChannelClosed(self.flow_id.clone())));
            return None;
        }

        let description = event.to_string();
        let mut backup = flow.snapshot();
        let result = if !flow.is_started() && event != FlowEvent::Reset {
            // Every flow starts with OnReset; a leading Resume is absorbed by it.
            match self.run_chain(flow, &mut backup, FlowEvent::Reset).await {
                Ok(version) if event == FlowEvent::Resume || flow.is_removed() => Ok(version),
                Ok(_) => self.run_chain(flow, &mut backup, event).await,
                Err(error) => Err(error),
            }
        } else {
            self.run_chain(flow, &mut backup, event).await
        };

        match result {
            Ok(version) => {
                self.services.events.emit(HostEvent::EventProcessed {
                    flow_id: self.flow_id.clone(),
                    event: description,
                    version,
                    timestamp: Utc::now(),
                });
                let _ = reply.send(Ok(version));
                if flow.is_removed() {
                    tracing::info!(flow_id = %self.flow_id, version, "`{}` is ended", self.flow_id);
                    self.services.events.emit(HostEvent::FlowEnded {
                        flow_id: self.flow_id.clone(),
                        version,
                        timestamp: Utc::now(),
                    });
                    return Some(StopReason::Ended);
                }
                None
            }
            Err(error) => {
                *flow = backup;
                if error.is_cancellation() {
                    let _ = reply.send(Err(FlowError::Cancelled));
                    if self.hard_stop.is_cancelled() {
                        return Some(StopReason::Disposed);
                    }
                    return None;
                }

                tracing::error!(
                    flow_id = %self.flow_id,
                    step = %flow.step(),
                    error = %error,
                    "`{}` @ {} failed",
                    self.flow_id,
                    flow.step()
                );
                self.services.events.emit(HostEvent::StepFailed {
                    flow_id: self.flow_id.clone(),
                    step: flow.step().to_string(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
                let stale = error.is_version_mismatch();
                let _ = reply.send(Err(error));
                if stale {
                    return self.reload(flow).await;
                }
                None
            }
        }
    }

    /// Replaces a flow whose stored copy was changed by another writer.
    async fn reload(&self, flow: &mut FlowInstance) -> Option<StopReason> {
        let loaded = tokio::select! {
            loaded = self.load() => loaded,
            _ = self.hard_stop.cancelled() => return Some(StopReason::Disposed),
        };
        match loaded {
            Ok(fresh) => {
                tracing::warn!(
                    flow_id = %self.flow_id,
                    stale = flow.version(),
                    version = fresh.version(),
                    "Reloaded flow after a concurrent write"
                );
                *flow = fresh;
                None
            }
            Err(error) => {
                tracing::error!(flow_id = %self.flow_id, error = %error, "Failed to reload flow");
                Some(StopReason::Failed)
            }
        }
    }

    /// Runs `event` and every auto-resume it triggers. `backup` tracks the
    /// last persisted state, which is what a failure rolls back to.
    async fn run_chain(
        &self,
        flow: &mut FlowInstance,
        backup: &mut FlowInstance,
        event: FlowEvent,
    ) -> Result<u64, FlowError> {
        let mut event = event;
        loop {
            let transition = flow.handle_event(event, self.hard_stop.clone()).await?;
            tracing::trace!(flow_id = %self.flow_id, transition = %transition, "Step completed");
            flow.apply_transition(&transition);

            if transition.effective_must_store() {
                self.store(flow, &transition).await?;
                *backup = flow.snapshot();
            }
            if transition.is_removal() || !transition.must_resume() {
                return Ok(flow.version());
            }
            event = FlowEvent::Resume;
        }
    }

    async fn store(&self, flow: &mut FlowInstance, transition: &FlowTransition) -> Result<(), FlowError> {
        let stored = if transition.is_removal() {
            None
        } else {
            Some(StoredFlow {
                version: flow.version(),
                step: flow.step().to_string(),
                hard_resume_at: flow.hard_resume_at(),
                data: flow.data()?,
            })
        };
        let version = self
            .services
            .store
            .save(flow.id(), flow.version(), stored, transition.events.clone())
            .await?;
        flow.set_version(version);
        Ok(())
    }

    fn on_stop(&self, reason: StopReason) {
        self.set_stop_reason(reason);
        let reason = (*self.stop_reason.lock()).unwrap_or(reason);

        let pending = {
            let mut inbox = self.inbox.lock();
            inbox.closed = true;
            std::mem::take(&mut inbox.queue)
        };
        let rejected = pending.len();
        for entry in pending {
            let _ = entry.reply.send(Err(FlowError::ChannelClosed(self.flow_id.clone())));
        }

        self.services.timeouts.remove(self.timeout_key);
        tracing::debug!(flow_id = %self.flow_id, ?reason, rejected, "Worklet stopped");
        self.services.events.emit(HostEvent::WorkletStopped {
            flow_id: self.flow_id.clone(),
            reason,
            timestamp: Utc::now(),
        });

        if let (Some(shard), Some(me)) = (self.shard.upgrade(), self.me.upgrade()) {
            shard.remove_worklet(&me);
        }
        self.stop_token.cancel();
        self.stopped.cancel();
    }
}

impl TimeoutHandler for FlowWorklet {
    fn on_timeout(&self) {
        let evict = {
            let mut inbox = self.inbox.lock();
            if inbox.idle && inbox.queue.is_empty() && !inbox.closed {
                inbox.closed = true;
                true
            } else {
                false
            }
        };
        if evict {
            tracing::debug!(flow_id = %self.flow_id, "Evicting idle worklet");
            self.set_stop_reason(StopReason::Idle);
            self.ready.notify_one();
        }
    }
}

impl std::fmt::Debug for FlowWorklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWorklet")
            .field("flow_id", &self.flow_id)
            .field("shard", &self.shard_index)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
