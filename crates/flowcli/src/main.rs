// crates/flowcli/src/main.rs

mod flows;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{FlowEvent, FlowEventEnvelope, FlowId};
use flowruntime::{FlowEventForwarder, FlowHost, HostConfig, HostEvent, InMemoryFlowStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow runtime CLI", long_about = None)]
struct Cli {
    /// Host configuration JSON file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deliver the events of a JSON file to their flows
    Run {
        /// Path to a JSON array of flow event envelopes
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Run the built-in onboarding and notification flows
    Demo {
        /// Number of onboarding users to simulate
        #[arg(short, long, default_value_t = 3)]
        users: usize,
    },

    /// List registered flow types and their steps
    Flows,

    /// Print the effective host configuration
    Config,

    /// Write an example events file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "events.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { file } => run_events(config, file).await?,
        Commands::Demo { users } => run_demo(config, users).await?,
        Commands::Flows => list_flows()?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
        Commands::Init { output } => create_example_events(output)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(HostConfig::from_json(&json)?)
        }
        None => Ok(HostConfig::default()),
    }
}

struct Runtime {
    host: Arc<FlowHost>,
    store: Arc<InMemoryFlowStore>,
    forwarder: FlowEventForwarder,
    lease: CancellationToken,
}

fn start_runtime(config: HostConfig) -> Result<Runtime> {
    let registry = Arc::new(flows::registry()?);
    let store = Arc::new(InMemoryFlowStore::new());
    let host = FlowHost::new(config, registry, store.clone())?;
    let lease = CancellationToken::new();
    host.run_all_shards(lease.clone())?;

    // Print lifecycle events as they happen
    let mut events = host.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HostEvent::EventProcessed { flow_id, event, version, .. } => {
                    println!("  ✅ {} <- {} (v.{})", flow_id, event, version);
                }
                HostEvent::StepFailed { flow_id, step, error, .. } => {
                    println!("  ❌ {} @ {} failed: {}", flow_id, step, error);
                }
                HostEvent::FlowEnded { flow_id, version, .. } => {
                    println!("  🏁 {} ended (v.{})", flow_id, version);
                }
                _ => {}
            }
        }
    });

    Ok(Runtime {
        forwarder: FlowEventForwarder::new(host.clone()),
        host,
        store,
        lease,
    })
}

impl Runtime {
    /// Forwards due timers until no flow is waiting on one, or `timeout`.
    async fn drain_timers(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.store.scheduled_count() > 0 && tokio::time::Instant::now() < deadline {
            for result in self.forwarder.forward_due(&self.store, self.lease.clone()).await {
                if let Err(error) = result {
                    tracing::warn!(error = %error, "Timer delivery failed");
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn shutdown(self) {
        self.host.dispose().await;
        self.lease.cancel();
    }
}

async fn run_events(config: HostConfig, file: PathBuf) -> Result<()> {
    println!("🚀 Loading events from: {}", file.display());
    let json = std::fs::read_to_string(&file)?;
    let envelopes: Vec<FlowEventEnvelope> = serde_json::from_str(&json)?;
    println!("📋 {} events", envelopes.len());

    let runtime = start_runtime(config)?;
    let mut failed = 0;
    for envelope in envelopes {
        if let Err(error) = runtime.forwarder.forward(envelope, runtime.lease.clone()).await {
            println!("  ❌ {}", error);
            failed += 1;
        }
    }
    runtime.drain_timers(Duration::from_secs(10)).await;

    println!();
    println!("📊 Summary: {} flows stored, {} failed events", runtime.store.len(), failed);
    runtime.shutdown().await;
    Ok(())
}

async fn run_demo(config: HostConfig, users: usize) -> Result<()> {
    let runtime = start_runtime(config)?;
    let host = runtime.host.clone();

    println!("▶️  Onboarding {} users", users);
    let mut tasks = Vec::new();
    for user in 0..users {
        let host = host.clone();
        let id = host.registry().new_id::<flows::Onboarding>(format!("user-{}", user))?;
        tasks.push(tokio::spawn(async move {
            let first = host.process_event(&id, FlowEvent::signal("Start"), CancellationToken::new()).await?;
            let last = host.process_event(&id, FlowEvent::signal("Start"), CancellationToken::new()).await?;
            Ok::<_, flowcore::FlowError>((id, first, last))
        }));
    }
    for task in tasks {
        let (id, first, last) = task.await??;
        println!("  👋 {}: v.{} -> v.{}", id, first, last);
    }

    println!("▶️  Sending a notification");
    let id = host.registry().new_id::<flows::Notification>("welcome-mail")?;
    host.process_event(&id, FlowEvent::Resume, CancellationToken::new()).await?;
    runtime.drain_timers(Duration::from_secs(5)).await;

    println!();
    println!(
        "✨ Demo finished: {} flows still stored, {} live worklets",
        runtime.store.len(),
        host.worklet_count()
    );
    runtime.shutdown().await;
    Ok(())
}

fn list_flows() -> Result<()> {
    println!("📦 Registered flow types:");
    println!();

    let registry = flows::registry()?;
    for name in registry.list_flow_types() {
        let flow_type = registry.flow_type(&name)?;
        println!("  • {}", name);
        println!("    steps: {}", flow_type.step_names().join(", "));
    }
    Ok(())
}

fn create_example_events(output: PathBuf) -> Result<()> {
    let user = FlowId::new("Onboarding", "user-42");
    let events = vec![
        FlowEventEnvelope::new(user.clone(), FlowEvent::signal("Start")),
        FlowEventEnvelope::new(user, FlowEvent::signal("Start")),
        FlowEventEnvelope::new(FlowId::new("Notification", "welcome-mail"), FlowEvent::Resume),
    ];

    let json = serde_json::to_string_pretty(&events)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example events: {}", output.display());
    println!();
    println!("Run them with:");
    println!("  flow run --file {}", output.display());
    Ok(())
}
