use serde::{Deserialize, Serialize};
use std::fmt;

use crate::FlowId;

/// An event addressed to a flow.
///
/// The first four variants are system events interpreted by the runtime;
/// `Timer` is raised by `wait_for_timer` transitions; everything else is a
/// `Domain` event owned by the product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowEvent {
    Reset,
    Resume,
    HardResume,
    Kill,
    Timer {
        tag: Option<String>,
    },
    Domain {
        kind: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl FlowEvent {
    pub fn domain(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        FlowEvent::Domain {
            kind: kind.into(),
            payload,
        }
    }

    pub fn signal(kind: impl Into<String>) -> Self {
        Self::domain(kind, serde_json::Value::Null)
    }

    /// System events never need to be accepted by a step.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            FlowEvent::Reset | FlowEvent::Resume | FlowEvent::HardResume | FlowEvent::Kill
        )
    }

    pub fn kind(&self) -> &str {
        match self {
            FlowEvent::Reset => "Reset",
            FlowEvent::Resume => "Resume",
            FlowEvent::HardResume => "HardResume",
            FlowEvent::Kill => "Kill",
            FlowEvent::Timer { .. } => "Timer",
            FlowEvent::Domain { kind, .. } => kind,
        }
    }
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowEvent::Timer { tag: Some(tag) } => write!(f, "Timer({})", tag),
            other => f.write_str(other.kind()),
        }
    }
}

/// A flow event together with its target, as delivered by an event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEventEnvelope {
    pub flow_id: FlowId,
    pub event: FlowEvent,
}

impl FlowEventEnvelope {
    pub fn new(flow_id: FlowId, event: FlowEvent) -> Self {
        Self { flow_id, event }
    }
}
