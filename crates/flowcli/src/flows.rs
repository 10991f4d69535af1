// crates/flowcli/src/flows.rs

use flowcore::{
    steps, BoxFuture, Flow, FlowError, FlowOptions, FlowRegistry, StepContext, StepResult, StepTable,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3600);

/// Greets a new user and completes on the second `Start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Onboarding {
    pub welcomed: bool,
    pub starts: u32,
}

fn onboarding_reset<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        flow.welcomed = false;
        flow.starts = 0;
        Ok(ctx.store_and_resume("Welcome"))
    })
}

fn onboarding_welcome<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if ctx.accept("Start").is_some() {
            tracing::info!(flow_id = %ctx.flow_id(), "Welcome!");
            flow.welcomed = true;
            flow.starts += 1;
            return ctx.wait_for_event("Complete", WAIT);
        }
        ctx.wait_for_event("Welcome", WAIT)
    })
}

fn onboarding_complete<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if ctx.accept("Start").is_some() {
            flow.starts += 1;
            return Ok(ctx.end(true));
        }
        ctx.wait_for_event("Complete", WAIT)
    })
}

impl Flow for Onboarding {
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
        table
            .add(steps::ON_RESET, onboarding_reset)?
            .add("Welcome", onboarding_welcome)?
            .add("Complete", onboarding_complete)?;
        Ok(())
    }
}

/// Delivers a notification, retrying on a growing timer until the
/// (simulated) channel accepts it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notification {
    pub attempts: u32,
    pub delivered: bool,
}

impl Notification {
    /// The simulated channel rejects the first two attempts.
    const FAILING_ATTEMPTS: u32 = 2;
}

fn notification_reset<'a>(flow: &'a mut Notification, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        flow.attempts = 0;
        flow.delivered = false;
        Ok(ctx.store_and_resume("Sending"))
    })
}

fn notification_sending<'a>(flow: &'a mut Notification, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        ctx.accept_timer();
        flow.attempts += 1;
        if flow.attempts > Notification::FAILING_ATTEMPTS {
            tracing::info!(flow_id = %ctx.flow_id(), attempts = flow.attempts, "Notification delivered");
            flow.delivered = true;
            return Ok(ctx.end(false));
        }
        let backoff = Duration::from_millis(100 * u64::from(flow.attempts));
        tracing::info!(flow_id = %ctx.flow_id(), attempt = flow.attempts, ?backoff, "Delivery failed, retrying");
        Ok(ctx.wait_for_timer("Sending", backoff, Some("retry".to_string())))
    })
}

impl Flow for Notification {
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
        table
            .add(steps::ON_RESET, notification_reset)?
            .add("Sending", notification_sending)?;
        Ok(())
    }

    fn options(&self) -> FlowOptions {
        FlowOptions::default().with_remove_delay(Duration::from_millis(200))
    }
}

pub fn registry() -> Result<FlowRegistry, FlowError> {
    let mut builder = FlowRegistry::builder();
    builder.add::<Onboarding>(None)?.add::<Notification>(None)?;
    Ok(builder.build())
}
