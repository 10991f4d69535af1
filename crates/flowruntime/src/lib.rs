//! Flow execution runtime
//!
//! This crate runs flows: each flow gets a worklet that processes its events
//! strictly in order, worklets live in shards owned by this process, and the
//! host routes events to them and retries across shard ownership changes.

mod config;
mod events;
mod forwarder;
mod host;
mod shard;
mod store;
mod timeouts;
mod worklet;

pub use config::HostConfig;
pub use events::{EventBus, HostEvent, StopReason};
pub use forwarder::FlowEventForwarder;
pub use host::FlowHost;
pub use shard::FlowHostShard;
pub use store::{FlowStore, InMemoryFlowStore, StoredFlow};
pub use timeouts::{TimeoutHandler, Timeouts};
pub use worklet::FlowWorklet;
