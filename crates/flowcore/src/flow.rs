use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    steps, FlowError, FlowEvent, FlowId, FlowOptions, FlowTransition, StepContext, StepResult,
    StepTable,
};

/// Core trait that every flow type implements.
///
/// A flow is a plain value: its fields are the type-specific state, while
/// identity, version and current step are tracked by the runtime in
/// [`FlowInstance`].
pub trait Flow: fmt::Debug + Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registers the step handlers of this type. `OnReset` is mandatory.
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError>;

    fn options(&self) -> FlowOptions {
        FlowOptions::default()
    }

    /// Deep copy used to roll the flow back when an event fails.
    fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Optional: turn a step failure into a transition instead of failing
    /// the event.
    fn on_error(&mut self, _error: &FlowError, _ctx: &mut StepContext) -> Option<FlowTransition> {
        None
    }
}

/// Object-safe view of a flow value of any registered type.
pub trait AnyFlow: Send + Sync + fmt::Debug {
    fn flow_type(&self) -> &str;

    fn snapshot(&self) -> Box<dyn AnyFlow>;

    fn to_data(&self) -> Result<serde_json::Value, FlowError>;

    fn options(&self) -> FlowOptions;

    fn has_step(&self, name: &str) -> bool;

    /// Runs step `step`, falling back to `OnMissingStep` for unknown names.
    fn invoke<'a>(&'a mut self, step: &'a str, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult>;

    fn on_error(&mut self, error: &FlowError, ctx: &mut StepContext) -> Option<FlowTransition>;

    fn as_any(&self) -> &dyn Any;
}

struct FlowBox<F: Flow> {
    state: F,
    steps: Arc<StepTable<F>>,
}

impl<F: Flow> fmt::Debug for FlowBox<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}

impl<F: Flow> AnyFlow for FlowBox<F> {
    fn flow_type(&self) -> &str {
        self.steps.flow_type()
    }

    fn snapshot(&self) -> Box<dyn AnyFlow> {
        Box::new(FlowBox {
            state: self.state.snapshot(),
            steps: self.steps.clone(),
        })
    }

    fn to_data(&self) -> Result<serde_json::Value, FlowError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn options(&self) -> FlowOptions {
        self.state.options()
    }

    fn has_step(&self, name: &str) -> bool {
        self.steps.contains(name)
    }

    fn invoke<'a>(&'a mut self, step: &'a str, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
        match self.steps.get(step, true) {
            Some(handler) => handler(&mut self.state, ctx),
            None => Box::pin(async move {
                Err(FlowError::NoStepImplementation {
                    flow_type: ctx.flow_id().name().to_string(),
                    step: step.to_string(),
                })
            }),
        }
    }

    fn on_error(&mut self, error: &FlowError, ctx: &mut StepContext) -> Option<FlowTransition> {
        self.state.on_error(error, ctx)
    }

    fn as_any(&self) -> &dyn Any {
        &self.state
    }
}

/// Type-erased factory for one registered flow type.
pub trait FlowType: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn AnyFlow>;

    fn restore(&self, data: serde_json::Value) -> Result<Box<dyn AnyFlow>, FlowError>;

    fn step_names(&self) -> Vec<String>;
}

pub(crate) struct TypedFlowType<F: Flow> {
    steps: Arc<StepTable<F>>,
}

impl<F: Flow> TypedFlowType<F> {
    pub(crate) fn build(name: &str) -> Result<Self, FlowError> {
        let mut table = StepTable::new(name);
        F::register_steps(&mut table)?;
        if !table.contains(steps::ON_RESET) {
            return Err(FlowError::MissingResetStep(name.to_string()));
        }
        Ok(Self {
            steps: Arc::new(table),
        })
    }
}

impl<F: Flow> FlowType for TypedFlowType<F> {
    fn name(&self) -> &str {
        self.steps.flow_type()
    }

    fn create(&self) -> Box<dyn AnyFlow> {
        Box::new(FlowBox {
            state: F::default(),
            steps: self.steps.clone(),
        })
    }

    fn restore(&self, data: serde_json::Value) -> Result<Box<dyn AnyFlow>, FlowError> {
        let state = if data.is_null() {
            F::default()
        } else {
            serde_json::from_value(data)?
        };
        Ok(Box::new(FlowBox {
            state,
            steps: self.steps.clone(),
        }))
    }

    fn step_names(&self) -> Vec<String> {
        self.steps.names()
    }
}

/// A live flow: identity, version, current step and the typed state.
#[derive(Debug)]
pub struct FlowInstance {
    id: FlowId,
    version: u64,
    step: String,
    hard_resume_at: Option<DateTime<Utc>>,
    state: Box<dyn AnyFlow>,
}

impl FlowInstance {
    pub fn new(
        id: FlowId,
        version: u64,
        step: impl Into<String>,
        hard_resume_at: Option<DateTime<Utc>>,
        state: Box<dyn AnyFlow>,
    ) -> Self {
        Self {
            id,
            version,
            step: step.into(),
            hard_resume_at,
            state,
        }
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn is_started(&self) -> bool {
        self.step != steps::STARTING
    }

    pub fn is_removed(&self) -> bool {
        self.step == steps::REMOVED
    }

    /// A flow can be resumed (hard-resumed after a restart) unless it ended.
    pub fn can_resume(&self) -> bool {
        self.is_started() && !self.is_removed()
    }

    pub fn hard_resume_at(&self) -> Option<DateTime<Utc>> {
        self.hard_resume_at
    }

    pub fn options(&self) -> FlowOptions {
        self.state.options()
    }

    pub fn data(&self) -> Result<serde_json::Value, FlowError> {
        self.state.to_data()
    }

    /// Typed access to the flow's state.
    pub fn state<F: Flow>(&self) -> Option<&F> {
        self.state.as_any().downcast_ref::<F>()
    }

    pub fn snapshot(&self) -> FlowInstance {
        FlowInstance {
            id: self.id.clone(),
            version: self.version,
            step: self.step.clone(),
            hard_resume_at: self.hard_resume_at,
            state: self.state.snapshot(),
        }
    }

    /// Picks the step an event runs against.
    pub fn select_step(&self, event: &FlowEvent) -> String {
        match event {
            FlowEvent::Kill => steps::ON_KILL.to_string(),
            FlowEvent::Reset => steps::ON_RESET.to_string(),
            _ if !self.is_started() => steps::ON_RESET.to_string(),
            FlowEvent::HardResume if self.state.has_step(steps::ON_HARD_RESUME) => {
                steps::ON_HARD_RESUME.to_string()
            }
            _ => self.step.clone(),
        }
    }

    /// Runs one step for `event` and returns the transition it produced.
    /// The transition is not applied; see [`FlowInstance::apply_transition`].
    pub async fn handle_event(
        &mut self,
        event: FlowEvent,
        cancellation: CancellationToken,
    ) -> Result<FlowTransition, FlowError> {
        let step = self.select_step(&event);
        let mut ctx = StepContext::new(
            self.id.clone(),
            self.version,
            step.clone(),
            event,
            self.state.options(),
            cancellation,
        );

        let result = match self.state.invoke(&step, &mut ctx).await {
            Ok(_) if !ctx.is_handled() => Err(FlowError::UnhandledEvent {
                flow_id: self.id.clone(),
                step: step.clone(),
                event: ctx.event().to_string(),
            }),
            other => other,
        };

        match result {
            Ok(transition) => Ok(transition),
            Err(error) if error.is_cancellation() || ctx.cancellation().is_cancelled() => Err(error),
            Err(error) => {
                ctx.set_step(step);
                match self.state.on_error(&error, &mut ctx) {
                    Some(transition) => {
                        tracing::warn!(flow_id = %self.id, error = %error, "step failure handled by OnError");
                        Ok(transition)
                    }
                    None => Err(error),
                }
            }
        }
    }

    pub fn apply_transition(&mut self, transition: &FlowTransition) {
        self.step = transition.step.clone();
        self.hard_resume_at = transition.hard_resume_at;
    }
}

impl fmt::Display for FlowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}('{}' @ {}, v.{})", self.state.flow_type(), self.id, self.step, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowRegistry;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        hits: u32,
        errors_seen: u32,
    }

    fn on_reset<'a>(flow: &'a mut Counter, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            flow.hits = 0;
            ctx.wait_for_event("Counting", std::time::Duration::from_secs(60))
        })
    }

    fn counting<'a>(flow: &'a mut Counter, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            if ctx.accept("Hit").is_some() {
                flow.hits += 1;
            }
            if ctx.accept("Fail").is_some() {
                return Err(FlowError::step("asked to fail"));
            }
            ctx.wait_for_event("Counting", std::time::Duration::from_secs(60))
        })
    }

    impl Flow for Counter {
        fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
            table.add(steps::ON_RESET, on_reset)?.add("Counting", counting)?;
            Ok(())
        }

        fn on_error(&mut self, error: &FlowError, ctx: &mut StepContext) -> Option<FlowTransition> {
            self.errors_seen += 1;
            match error {
                FlowError::Step(_) if self.errors_seen > 1 => Some(ctx.store_and_resume("Counting")),
                _ => None,
            }
        }
    }

    fn new_counter() -> FlowInstance {
        let mut builder = FlowRegistry::builder();
        builder.add::<Counter>(None).unwrap();
        let registry = builder.build();
        registry.create(&FlowId::new("Counter", "c-1")).unwrap()
    }

    #[test]
    fn step_selection() {
        let mut flow = new_counter();
        assert_eq!(flow.select_step(&FlowEvent::signal("Hit")), steps::ON_RESET);
        flow.apply_transition(&FlowTransition::new("Counting"));
        assert_eq!(flow.select_step(&FlowEvent::signal("Hit")), "Counting");
        assert_eq!(flow.select_step(&FlowEvent::Resume), "Counting");
        assert_eq!(flow.select_step(&FlowEvent::Reset), steps::ON_RESET);
        assert_eq!(flow.select_step(&FlowEvent::Kill), steps::ON_KILL);
        // No OnHardResume registered: the current step is re-entered.
        assert_eq!(flow.select_step(&FlowEvent::HardResume), "Counting");
    }

    #[tokio::test]
    async fn domain_events_must_be_accepted() {
        let mut flow = new_counter();
        let transition = flow.handle_event(FlowEvent::Reset, CancellationToken::new()).await.unwrap();
        flow.apply_transition(&transition);

        let transition = flow.handle_event(FlowEvent::signal("Hit"), CancellationToken::new()).await.unwrap();
        assert_eq!(transition.step, "Counting");
        assert_eq!(flow.state::<Counter>().unwrap().hits, 1);

        let error = flow
            .handle_event(FlowEvent::signal("Unknown"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, FlowError::UnhandledEvent { ref step, .. } if step == "Counting"));
    }

    #[tokio::test]
    async fn on_error_can_recover() {
        let mut flow = new_counter();
        flow.apply_transition(&FlowTransition::new("Counting"));

        let first = flow.handle_event(FlowEvent::signal("Fail"), CancellationToken::new()).await;
        assert!(matches!(first, Err(FlowError::Step(_))));

        let second = flow.handle_event(FlowEvent::signal("Fail"), CancellationToken::new()).await;
        assert_eq!(second.unwrap().step, "Counting");
    }

    #[tokio::test]
    async fn snapshot_is_independent() {
        let mut flow = new_counter();
        flow.apply_transition(&FlowTransition::new("Counting"));
        let backup = flow.snapshot();

        flow.handle_event(FlowEvent::signal("Hit"), CancellationToken::new()).await.unwrap();
        assert_eq!(flow.state::<Counter>().unwrap().hits, 1);
        assert_eq!(backup.state::<Counter>().unwrap().hits, 0);
        assert_eq!(backup.step(), "Counting");
    }

    #[tokio::test]
    async fn unknown_step_falls_back_to_missing_step() {
        let mut flow = new_counter();
        flow.apply_transition(&FlowTransition::new("RenamedLongAgo"));
        let error = flow.handle_event(FlowEvent::Resume, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            error,
            FlowError::NoStepImplementation { ref step, .. } if step == "RenamedLongAgo"
        ));
    }
}
