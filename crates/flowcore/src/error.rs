use crate::FlowId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Key exists: {0}")]
    KeyExists(String),

    #[error("Unknown flow type: {0}")]
    UnknownFlowType(String),

    #[error("Flow type '{0}' has no OnReset step")]
    MissingResetStep(String),

    #[error("Flow type '{flow_type}' has no implementation for step '{step}'")]
    NoStepImplementation { flow_type: String, step: String },

    #[error("`{flow_id}` @ '{step}': unhandled event '{event}'")]
    UnhandledEvent {
        flow_id: FlowId,
        step: String,
        event: String,
    },

    #[error("Wrong shard: shard {shard} is not owned by this host")]
    WrongShard { shard: usize },

    #[error("Channel closed: worklet for `{0}` is stopping")]
    ChannelClosed(FlowId),

    #[error("Flow host is already disposed")]
    AlreadyDisposed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Version mismatch for `{flow_id}`: expected {expected}, actual {actual}")]
    VersionMismatch {
        flow_id: FlowId,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Step failed: {0}")]
    Step(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Shorthand for a failure raised from inside a step body.
    pub fn step(message: impl Into<String>) -> Self {
        FlowError::Step(message.into())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FlowError::Cancelled)
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, FlowError::ChannelClosed(_))
    }

    /// The stored flow was changed by another writer.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, FlowError::VersionMismatch { .. })
    }

    /// Errors the host recovers from by re-resolving the worklet.
    pub fn is_retryable_routing(&self) -> bool {
        matches!(
            self,
            FlowError::WrongShard { .. } | FlowError::ChannelClosed(_) | FlowError::Cancelled
        )
    }
}
