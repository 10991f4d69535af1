use chrono::Utc;
use flowcore::{FlowError, FlowEventEnvelope};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::host::FlowHost;
use crate::store::InMemoryFlowStore;

/// Feeds inbound flow events into a [`FlowHost`].
#[derive(Debug, Clone)]
pub struct FlowEventForwarder {
    host: Arc<FlowHost>,
}

impl FlowEventForwarder {
    pub fn new(host: Arc<FlowHost>) -> Self {
        Self { host }
    }

    pub async fn forward(
        &self,
        envelope: FlowEventEnvelope,
        cancellation: CancellationToken,
    ) -> Result<u64, FlowError> {
        self.host
            .process_event(&envelope.flow_id, envelope.event, cancellation)
            .await
    }

    /// Forwards envelopes one by one until the channel closes or `cancellation`
    /// fires. Returns how many were delivered successfully.
    pub async fn run(
        &self,
        mut receiver: mpsc::Receiver<FlowEventEnvelope>,
        cancellation: CancellationToken,
    ) -> usize {
        let mut delivered = 0;
        loop {
            let envelope = tokio::select! {
                _ = cancellation.cancelled() => break,
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let flow_id = envelope.flow_id.clone();
            match self.forward(envelope, cancellation.clone()).await {
                Ok(version) => {
                    tracing::debug!(flow_id = %flow_id, version, "Event forwarded");
                    delivered += 1;
                }
                Err(error) if error.is_cancellation() && cancellation.is_cancelled() => break,
                Err(error) => tracing::warn!(flow_id = %flow_id, error = %error, "Failed to forward event"),
            }
        }
        delivered
    }

    /// Delivers the scheduled events that are due in `store`.
    pub async fn forward_due(
        &self,
        store: &InMemoryFlowStore,
        cancellation: CancellationToken,
    ) -> Vec<Result<u64, FlowError>> {
        let mut results = Vec::new();
        for envelope in store.take_due(Utc::now()) {
            results.push(self.forward(envelope, cancellation.clone()).await);
        }
        results
    }
}
