//! Phoenix - GPU failover orchestration
//!
//! ## Usage
//!
//! ```bash
//! # Run a failover against the in-process simulated cloud
//! phoenix simulate --scenario standby
//! phoenix simulate --scenario no-capacity --journal /tmp/phoenix.jsonl
//! phoenix simulate --scenario snapshot --s3-bucket my-phoenix-snapshots
//!
//! # Cost / recovery table for a $1.50/h GPU
//! phoenix estimate --gpu-price 1.50
//!
//! # Past failovers from a journal
//! phoenix history --journal /tmp/phoenix.jsonl --instance gpu-1
//!
//! # Configuration
//! phoenix config default > phoenix.json
//! phoenix config check phoenix.json
//! ```

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use phoenix_core::{
    Backend, BlobStore, FailoverEvent, FailoverStrategyConfig, InstanceId, ProtectedInstance,
    StrategyKind, StrategyParams, SyncState, TriggerReason, Workspace,
};
use phoenix_orchestrator::{
    CostModel, HistoryQuery, HistoryStore, MemoryBlobStore, Orchestrator, OrchestratorConfig,
    S3BlobStore, SimulatedCloud, StatusEvent, StrategyEstimate, compute_metrics, create_s3_client,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "phoenix")]
#[command(about = "GPU failover orchestration: CPU standby, replacement search, restore")]
#[command(version)]
struct Cli {
    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one failover against the simulated cloud
    Simulate {
        #[arg(long, value_enum, default_value_t = Scenario::Standby)]
        scenario: Scenario,

        /// Configuration file (defaults to short simulation timings)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Journal the failover into this file
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Store snapshot blobs in this S3 bucket instead of memory
        #[arg(long)]
        s3_bucket: Option<String>,

        /// AWS region of the S3 bucket
        #[arg(long)]
        s3_region: Option<String>,
    },

    /// Show incremental cost and expected recovery time per strategy
    Estimate {
        /// Hourly price of the protected GPU (USD)
        #[arg(long)]
        gpu_price: f64,

        /// Only this strategy
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Workspace disk size (GB)
        #[arg(long, default_value_t = 100)]
        disk_gb: u32,
    },

    /// Print failover events and metrics from a journal
    History {
        #[arg(long)]
        journal: PathBuf,

        #[arg(long)]
        instance: Option<String>,

        /// Events started at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a configuration file
    Check { file: PathBuf },
    /// Print the default configuration
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// CPU standby serves while a replacement GPU is found
    Standby,
    /// Restore from the latest snapshot
    Snapshot,
    /// No replacement capacity; the standby keeps serving
    NoCapacity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());

    match cli.command {
        Commands::Simulate {
            scenario,
            config,
            journal,
            s3_bucket,
            s3_region,
        } => {
            let blobs: Arc<dyn BlobStore> = match s3_bucket {
                Some(bucket) => {
                    info!(bucket = %bucket, "Snapshot blobs stored in S3");
                    Arc::new(S3BlobStore::new(create_s3_client(s3_region).await, bucket).with_prefix("phoenix-sim"))
                }
                None => Arc::new(MemoryBlobStore::new()),
            };
            simulate(scenario, config, journal, blobs).await
        }
        Commands::Estimate {
            gpu_price,
            strategy,
            disk_gb,
        } => estimate(gpu_price, strategy, disk_gb),
        Commands::History {
            journal,
            instance,
            since,
        } => history(journal, instance, since).await,
        Commands::Config { action } => match action {
            ConfigAction::Check { file } => {
                OrchestratorConfig::from_file(&file)
                    .with_context(|| format!("invalid configuration {}", file.display()))?;
                println!("{}: ok", file.display());
                Ok(())
            }
            ConfigAction::Default => {
                println!("{}", serde_json::to_string_pretty(&OrchestratorConfig::default())?);
                Ok(())
            }
        },
    }
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "phoenix.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phoenix=info,phoenix_orchestrator=info,warn".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn simulate(
    scenario: Scenario,
    config: Option<PathBuf>,
    journal: Option<PathBuf>,
    blobs: Arc<dyn BlobStore>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => OrchestratorConfig::from_file(&path)
            .with_context(|| format!("invalid configuration {}", path.display()))?,
        None => OrchestratorConfig::fast(),
    };
    let history = match journal {
        Some(path) => HistoryStore::open(&path)
            .await
            .with_context(|| format!("cannot open journal {}", path.display()))?,
        None => HistoryStore::in_memory(),
    };

    let cloud = Arc::new(SimulatedCloud::new());
    let primary = cloud.launch_existing("gpu-1", Backend::SpotGpu, "eu-west-1").await;
    if let Some(ws) = cloud.memory_workspace(&primary.id).await {
        ws.write("models/weights.bin", &vec![7u8; 64 * 1024]).await?;
        ws.write("config/serving.json", br#"{"batch_size":8}"#).await?;
        ws.write("notebooks/train.ipynb", b"{}").await?;
    }

    cloud.add_capacity(Backend::ReliableCpu, "cpu-4", "eu-west-1", 0.08, 1).await;
    if scenario != Scenario::NoCapacity {
        cloud.add_capacity(Backend::SpotGpu, "RTX_4090", "eu-west-1", 1.42, 2).await;
    }

    let orchestrator = Orchestrator::with_history(cloud.clone(), blobs, config, history);
    let mut feed = orchestrator.events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            if let StatusEvent::PhaseChanged { instance_id, phase, .. } = &event {
                info!(instance_id = %instance_id, phase = %phase, "status");
            }
        }
    });

    let strategy = match scenario {
        Scenario::Standby | Scenario::NoCapacity => StrategyKind::CpuStandby,
        Scenario::Snapshot => StrategyKind::Snapshot,
    };
    let params = StrategyParams {
        machine_class: Some("cpu-4".into()),
        ..Default::default()
    };
    orchestrator
        .protect(
            ProtectedInstance::new("gpu-1", "RTX_4090", 1.50, "eu-west-1", "demo"),
            FailoverStrategyConfig::new(primary.id.clone(), strategy).with_params(params),
        )
        .await?;

    match strategy {
        StrategyKind::CpuStandby => wait_for_standby(&orchestrator, &primary.id).await?,
        _ => {
            let instance = orchestrator.instances.get(&primary.id).await?;
            let snapshot = orchestrator.snapshots.create(&instance.handle(), Some("before-loss".into())).await?;
            info!(snapshot = %snapshot.id, bytes = snapshot.size_bytes, "Snapshot taken");
        }
    }

    cloud.preempt(&primary.id).await;
    let event = orchestrator
        .trigger(&primary.id, TriggerReason::Preemption)
        .await?
        .wait()
        .await?;

    print_event(&event)?;
    let metrics = orchestrator.history.metrics(&HistoryQuery::default()).await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    orchestrator.shutdown().await;
    printer.abort();
    Ok(())
}

async fn wait_for_standby(orchestrator: &Orchestrator, id: &InstanceId) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if orchestrator.standbys.get(id).await.map(|a| a.sync_state) == Some(SyncState::Ready) {
            info!(instance_id = %id, "Standby ready");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("standby for {} never became ready", id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn estimate(gpu_price: f64, strategy: Option<StrategyKind>, disk_gb: u32) -> anyhow::Result<()> {
    if gpu_price <= 0.0 {
        bail!("--gpu-price must be positive");
    }
    let params = StrategyParams {
        disk_size_gb: disk_gb,
        ..Default::default()
    };
    let model = CostModel::default();
    let rows = match strategy {
        Some(s) => vec![model.estimate(s, gpu_price, &params)],
        None => model.compare(gpu_price, &params),
    };

    println!(
        "{:<16} {:>10} {:>10} {:>12} {:>12}  {}",
        "strategy", "extra $/h", "tier", "continuity", "gpu back", "holds"
    );
    for row in &rows {
        print_estimate(row);
    }
    Ok(())
}

fn print_estimate(row: &StrategyEstimate) {
    let secs = |s: Option<u64>| s.map(|s| format!("{}s", s)).unwrap_or_else(|| "-".into());
    println!(
        "{:<16} {:>10.4} {:>10} {:>12} {:>12}  {}",
        row.strategy.to_string(),
        row.extra_hourly_cost,
        format!("{:?}", row.tier).to_lowercase(),
        secs(row.expected_continuity_secs),
        secs(row.expected_recovery_secs),
        row.extra_resource
    );
}

async fn history(journal: PathBuf, instance: Option<String>, since: Option<DateTime<Utc>>) -> anyhow::Result<()> {
    if !journal.exists() {
        bail!("journal {} does not exist", journal.display());
    }
    let store = HistoryStore::open(&journal)
        .await
        .with_context(|| format!("cannot read journal {}", journal.display()))?;

    let mut query = match instance {
        Some(id) => HistoryQuery::for_instance(InstanceId::new(id)),
        None => HistoryQuery::default(),
    };
    if let Some(since) = since {
        query = query.since(since);
    }

    let events = store.query(&query).await;
    if events.is_empty() {
        warn!("No failover events match");
    }
    for event in &events {
        print_event(event)?;
    }
    println!("{}", serde_json::to_string_pretty(&compute_metrics(&events))?);
    Ok(())
}

fn print_event(event: &FailoverEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(event)?);
    Ok(())
}
