//! Step dispatch: each flow type registers its step handlers by name once,
//! and the runtime looks them up by the persisted step name.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;

use crate::{Flow, FlowError, FlowTransition, StepContext};

pub type StepResult = Result<FlowTransition, FlowError>;

/// A step handler of flow type `F`.
///
/// Plain `fn` items coerce to this type:
///
/// ```ignore
/// fn on_reset<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
///     Box::pin(async move { Ok(ctx.store_and_resume("Welcome")) })
/// }
/// ```
pub type StepFn<F> = for<'a> fn(&'a mut F, &'a mut StepContext) -> BoxFuture<'a, StepResult>;

/// Reserved step names.
pub mod steps {
    /// The step of a flow that was never initialized.
    pub const STARTING: &str = "";
    pub const ON_RESET: &str = "OnReset";
    pub const ON_HARD_RESUME: &str = "OnHardResume";
    pub const ON_KILL: &str = "OnKill";
    pub const ON_ENDING: &str = "OnEnding";
    pub const ON_END: &str = "OnEnd";
    pub const ON_MISSING_STEP: &str = "OnMissingStep";
    /// Terminal step: the flow is deleted from the store and its worklet exits.
    pub const REMOVED: &str = "Removed";

    pub const RESERVED: [&str; 6] = [ON_RESET, ON_HARD_RESUME, ON_KILL, ON_ENDING, ON_END, ON_MISSING_STEP];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

/// Name -> handler table for one flow type, built once at registration.
pub struct StepTable<F> {
    flow_type: String,
    handlers: HashMap<String, StepFn<F>>,
    overridden: Vec<String>,
}

impl<F: Flow> StepTable<F> {
    pub(crate) fn new(flow_type: impl Into<String>) -> Self {
        let mut handlers: HashMap<String, StepFn<F>> = HashMap::new();
        handlers.insert(steps::ON_KILL.to_string(), default_on_kill::<F>);
        handlers.insert(steps::ON_ENDING.to_string(), default_on_ending::<F>);
        handlers.insert(steps::ON_END.to_string(), default_on_end::<F>);
        handlers.insert(steps::ON_MISSING_STEP.to_string(), default_on_missing_step::<F>);
        Self {
            flow_type: flow_type.into(),
            handlers,
            overridden: Vec::new(),
        }
    }

    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    /// Registers `handler` under `name`. Reserved steps may be overridden
    /// once; any other name may be registered only once.
    pub fn add(&mut self, name: &str, handler: StepFn<F>) -> Result<&mut Self, FlowError> {
        if name.is_empty() || name == steps::REMOVED {
            return Err(FlowError::Internal(format!(
                "'{}' is not a valid step name for '{}'",
                name, self.flow_type
            )));
        }
        let is_default = steps::is_reserved(name) && !self.overridden.iter().any(|s| s == name);
        if self.handlers.contains_key(name) && !is_default {
            return Err(FlowError::KeyExists(format!("{}.{}", self.flow_type, name)));
        }
        self.handlers.insert(name.to_string(), handler);
        if steps::is_reserved(name) {
            self.overridden.push(name.to_string());
        }
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Looks a step up; with `use_fallback` an unknown name resolves to
    /// `OnMissingStep`.
    pub fn get(&self, name: &str, use_fallback: bool) -> Option<StepFn<F>> {
        match self.handlers.get(name) {
            Some(handler) => Some(*handler),
            None if use_fallback => self.handlers.get(steps::ON_MISSING_STEP).copied(),
            None => None,
        }
    }

    pub fn resolve(&self, name: &str) -> Result<StepFn<F>, FlowError> {
        self.get(name, false)
            .ok_or_else(|| FlowError::NoStepImplementation {
                flow_type: self.flow_type.clone(),
                step: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<F> fmt::Debug for StepTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("StepTable")
            .field("flow_type", &self.flow_type)
            .field("steps", &names)
            .finish()
    }
}

// Default reserved steps

fn default_on_kill<'a, F>(_flow: &'a mut F, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move { Ok(ctx.end(true)) })
}

fn default_on_ending<'a, F>(_flow: &'a mut F, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let remove_delay = ctx.options().remove_delay();
        Ok(ctx.wait_for_timer(steps::ON_END, remove_delay, None))
    })
}

fn default_on_end<'a, F>(_flow: &'a mut F, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        // Anything but the removal timer (or a system event) stays unhandled.
        ctx.accept_timer();
        Ok(ctx.store_and_resume(steps::REMOVED))
    })
}

fn default_on_missing_step<'a, F>(
    _flow: &'a mut F,
    ctx: &'a mut StepContext,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        Err(FlowError::NoStepImplementation {
            flow_type: ctx.flow_id().name().to_string(),
            step: ctx.step().to_string(),
        })
    })
}
