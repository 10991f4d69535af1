// Shared flows and host setup for the runtime integration tests.
#![allow(dead_code)]

use flowcore::{
    steps, BoxFuture, Flow, FlowError, FlowOptions, FlowRegistry, FlowRegistryBuilder, RetryPolicy,
    StepContext, StepResult, StepTable,
};
use flowruntime::{FlowHost, HostConfig, InMemoryFlowStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

// Journal: records appended entries, echoing each one in a chained step.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    pub entries: Vec<String>,
    #[serde(default)]
    pub pending: Option<String>,
}

fn journal_reset<'a>(flow: &'a mut Journal, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        flow.entries.clear();
        ctx.wait_for_event("Recording", HOUR)
    })
}

fn journal_recording<'a>(flow: &'a mut Journal, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if let Some(payload) = ctx.accept("Append") {
            let text = payload.as_str().unwrap_or_default().to_string();
            tokio::time::sleep(Duration::from_millis(2)).await;
            flow.entries.push(text.clone());
            flow.pending = Some(text);
            return Ok(ctx.store_and_resume("Echo"));
        }
        if ctx.accept("Fail").is_some() {
            flow.entries.push("partial".to_string());
            return Err(FlowError::step("journal rejected the entry"));
        }
        ctx.wait_for_event("Recording", HOUR)
    })
}

fn journal_echo<'a>(flow: &'a mut Journal, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if let Some(text) = flow.pending.take() {
            flow.entries.push(format!("echo:{}", text));
        }
        ctx.wait_for_event("Recording", HOUR)
    })
}

impl Flow for Journal {
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
        table
            .add(steps::ON_RESET, journal_reset)?
            .add("Recording", journal_recording)?
            .add("Echo", journal_echo)?;
        Ok(())
    }
}

// Onboarding: OnReset -> Welcome -> Complete -> OnEnd.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Onboarding {
    pub welcomed: bool,
    pub starts: u32,
}

fn onboarding_reset<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        flow.welcomed = false;
        Ok(ctx.store_and_resume("Welcome"))
    })
}

fn onboarding_welcome<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if ctx.accept("Start").is_some() {
            flow.welcomed = true;
            flow.starts += 1;
            return ctx.wait_for_event("Complete", HOUR);
        }
        ctx.wait_for_event("Welcome", HOUR)
    })
}

fn onboarding_complete<'a>(flow: &'a mut Onboarding, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if ctx.accept("Start").is_some() {
            if !flow.welcomed {
                return Err(FlowError::step("completed before welcome"));
            }
            flow.starts += 1;
            return Ok(ctx.end(true));
        }
        ctx.wait_for_event("Complete", HOUR)
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

// Napper: naps for the requested number of milliseconds. Short keep-alive
// and grace windows.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Napper {
    pub naps: u32,
}

fn napper_reset<'a>(_flow: &'a mut Napper, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move { ctx.wait_for_event("Napping", HOUR) })
}

fn napper_napping<'a>(flow: &'a mut Napper, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if let Some(payload) = ctx.accept("Nap") {
            let nap = Duration::from_millis(payload.as_u64().unwrap_or(0));
            let cancellation = ctx.cancellation().clone();
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancellation.cancelled() => return Err(FlowError::Cancelled),
            }
            flow.naps += 1;
        }
        ctx.wait_for_event("Napping", HOUR)
    })
}

impl Flow for Napper {
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
        table
            .add(steps::ON_RESET, napper_reset)?
            .add("Napping", napper_napping)?;
        Ok(())
    }

    fn options(&self) -> FlowOptions {
        FlowOptions::default()
            .with_keep_alive(Duration::from_millis(50))
            .with_graceful_dispose_timeout(Duration::from_millis(50))
    }
}

// Reminder: rings once on a timer, then ends.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reminder {
    pub rings: u32,
}

fn reminder_reset<'a>(_flow: &'a mut Reminder, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        Ok(ctx.wait_for_timer("Ringing", Duration::from_millis(200), Some("ring".to_string())))
    })
}

fn reminder_ringing<'a>(flow: &'a mut Reminder, ctx: &'a mut StepContext) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        if ctx.accept_timer().is_some() {
            flow.rings += 1;
            return Ok(ctx.end(true));
        }
        ctx.wait_for_event("Ringing", HOUR)
    })
}

impl Flow for Reminder {
    fn register_steps(table: &mut StepTable<Self>) -> Result<(), FlowError> {
        table
            .add(steps::ON_RESET, reminder_reset)?
            .add("Ringing", reminder_ringing)?;
        Ok(())
    }
}

pub fn registry_with(extra: impl FnOnce(&mut FlowRegistryBuilder)) -> Arc<FlowRegistry> {
    let mut builder = FlowRegistry::builder();
    builder
        .add::<Journal>(None)
        .and_then(|b| b.add::<Onboarding>(None))
        .and_then(|b| b.add::<Napper>(None))
        .and_then(|b| b.add::<Reminder>(None))
        .expect("test flows register");
    extra(&mut builder);
    Arc::new(builder.build())
}

pub struct TestHost {
    pub host: Arc<FlowHost>,
    pub store: Arc<InMemoryFlowStore>,
    pub lease: CancellationToken,
}

pub fn config(shard_count: usize) -> HostConfig {
    HostConfig::default()
        .with_shard_count(shard_count)
        .with_retry(RetryPolicy::fixed(Duration::from_millis(10)))
}

/// A host without any owned shard.
pub fn idle_host(shard_count: usize, extra: impl FnOnce(&mut FlowRegistryBuilder)) -> TestHost {
    init_tracing();
    let store = Arc::new(InMemoryFlowStore::new());
    let host = FlowHost::new(config(shard_count), registry_with(extra), store.clone()).expect("valid config");
    TestHost {
        host,
        store,
        lease: CancellationToken::new(),
    }
}

/// A host owning all of its shards.
pub fn start_host(shard_count: usize) -> TestHost {
    start_host_with(shard_count, |_| {})
}

pub fn start_host_with(shard_count: usize, extra: impl FnOnce(&mut FlowRegistryBuilder)) -> TestHost {
    let test_host = idle_host(shard_count, extra);
    test_host
        .host
        .run_all_shards(test_host.lease.clone())
        .expect("shards acquired");
    test_host
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
