//! Core abstractions for the flow runtime
//!
//! This crate provides flow identity, events, the step programming model
//! and the flow type registry. Steps are async, but nothing here spawns
//! tasks or needs a running executor.

mod error;
mod event;
mod flow;
mod id;
mod options;
mod registry;
mod step;
mod transition;

pub use error::FlowError;
pub use event::{FlowEvent, FlowEventEnvelope};
pub use flow::{AnyFlow, Flow, FlowInstance, FlowType};
pub use id::FlowId;
pub use options::{FlowOptions, RetryPolicy};
pub use registry::{FlowRegistry, FlowRegistryBuilder};
pub use step::{steps, StepFn, StepResult, StepTable};
pub use transition::{FlowTransition, ScheduledEvent, StepContext};

/// Re-exported so step handlers can name their return type.
pub use futures::future::BoxFuture;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
