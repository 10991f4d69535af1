use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{steps, FlowError, StepResult, FlowEvent, FlowEventEnvelope, FlowId, FlowOptions};

/// The outcome of one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTransition {
    pub step: String,
    pub must_store: bool,
    /// When set, the step chain stops here and the flow waits for an event
    /// (or a hard resume at this moment).
    pub hard_resume_at: Option<DateTime<Utc>>,
    pub events: Vec<ScheduledEvent>,
}

impl FlowTransition {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            must_store: false,
            hard_resume_at: None,
            events: Vec::new(),
        }
    }

    pub fn must_resume(&self) -> bool {
        self.hard_resume_at.is_none()
    }

    pub fn is_removal(&self) -> bool {
        self.step == steps::REMOVED
    }

    /// The terminal step is always persisted, even if the step forgot to ask.
    pub fn effective_must_store(&self) -> bool {
        self.must_store || self.is_removal()
    }
}

impl fmt::Display for FlowTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-> '{}'", self.step)?;
        if self.must_store {
            f.write_str(" +store")?;
        }
        match self.hard_resume_at {
            Some(at) => write!(f, " (wait until {})", at.to_rfc3339()),
            None => f.write_str(" (resume)"),
        }
    }
}

/// An event the store must deliver back to the flow at `due_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub due_at: DateTime<Utc>,
    pub envelope: FlowEventEnvelope,
}

/// Everything a step body can see about the flow it runs for.
#[derive(Debug)]
pub struct StepContext {
    flow_id: FlowId,
    version: u64,
    step: String,
    event: FlowEvent,
    handled: bool,
    options: FlowOptions,
    cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(
        flow_id: FlowId,
        version: u64,
        step: impl Into<String>,
        event: FlowEvent,
        options: FlowOptions,
        cancellation: CancellationToken,
    ) -> Self {
        let handled = event.is_system();
        Self {
            flow_id,
            version,
            step: step.into(),
            event,
            handled,
            options,
            cancellation,
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The step being executed.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub(crate) fn set_step(&mut self, step: impl Into<String>) {
        self.step = step.into();
    }

    pub fn event(&self) -> &FlowEvent {
        &self.event
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    /// Accepts the current event if it is a domain event of `kind`, returning
    /// its payload.
    pub fn accept(&mut self, kind: &str) -> Option<serde_json::Value> {
        match &self.event {
            FlowEvent::Domain { kind: k, payload } if k == kind => {
                self.handled = true;
                Some(payload.clone())
            }
            _ => None,
        }
    }

    /// Accepts the current event if it is a timer event.
    pub fn accept_timer(&mut self) -> Option<Option<String>> {
        match &self.event {
            FlowEvent::Timer { tag } => {
                self.handled = true;
                Some(tag.clone())
            }
            _ => None,
        }
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn check_cancelled(&self) -> Result<(), FlowError> {
        if self.cancellation.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        Ok(())
    }

    // Transition helpers

    /// Continue with `next_step` right away, without persisting.
    pub fn resume(&self, next_step: impl Into<String>) -> FlowTransition {
        FlowTransition::new(next_step)
    }

    pub fn store_and_resume(&self, next_step: impl Into<String>) -> FlowTransition {
        FlowTransition {
            must_store: true,
            ..FlowTransition::new(next_step)
        }
    }

    /// Persist and wait for the next external event; the flow is hard-resumed
    /// after `hard_resume_delay` if nothing arrives. The delay must be
    /// positive.
    pub fn wait_for_event(&self, next_step: impl Into<String>, hard_resume_delay: Duration) -> StepResult {
        if hard_resume_delay.is_zero() {
            return Err(FlowError::InvalidArgument(format!(
                "`{}` @ '{}': hard resume delay must be positive",
                self.flow_id, self.step
            )));
        }
        Ok(FlowTransition {
            must_store: true,
            hard_resume_at: Some(Utc::now() + to_chrono(hard_resume_delay)),
            ..FlowTransition::new(next_step)
        })
    }

    /// Persist and schedule a `Timer` event after `delay`.
    pub fn wait_for_timer(
        &self,
        next_step: impl Into<String>,
        delay: Duration,
        tag: Option<String>,
    ) -> FlowTransition {
        if delay.is_zero() {
            return self.store_and_resume(next_step);
        }
        let resume_at = Utc::now() + to_chrono(delay);
        FlowTransition {
            must_store: true,
            hard_resume_at: Some(resume_at),
            events: vec![ScheduledEvent {
                due_at: resume_at,
                envelope: FlowEventEnvelope::new(self.flow_id.clone(), FlowEvent::Timer { tag }),
            }],
            ..FlowTransition::new(next_step)
        }
    }

    pub fn end(&self, instantly: bool) -> FlowTransition {
        let next_step = if instantly {
            steps::ON_END
        } else {
            steps::ON_ENDING
        };
        self.store_and_resume(next_step)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
