//! dormant - drive the bridge against a simulated host scheduler.
//!
//! `simulate` registers two demo tasks and replays host wakes on a virtual
//! clock. `status` prints what a JSON state file holds.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dormant_core::impls::{InMemoryHostScheduler, JsonFileStateStore};
use dormant_core::ports::{Clock, FixedClock, StateStore, SystemClock};
use dormant_core::{
    BridgeBuilder, BridgeConfig, Handler, HandlerFailure, RunCounts, Task, TaskDefinition,
    TaskName, Trigger, WakeContext,
};

#[derive(Parser)]
#[command(name = "dormant")]
#[command(about = "Background task scheduling bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay host wakes for the demo tasks on a virtual clock
    Simulate {
        /// Configuration file path
        #[arg(short, long, env = "DORMANT_CONFIG")]
        config: Option<PathBuf>,

        /// JSON state file (overrides `store.path`)
        #[arg(long)]
        store: Option<PathBuf>,

        /// Virtual hours to simulate
        #[arg(long, default_value_t = 2)]
        hours: u32,

        /// Execution budget granted per wake, in seconds
        #[arg(long, default_value_t = 30)]
        budget_secs: u64,
    },

    /// Print the runs recorded in a JSON state file
    Status {
        #[arg(long)]
        store: PathBuf,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshFeed {
    url: String,
}

impl Task for RefreshFeed {
    const HANDLER: &'static str = "feed.refresh.v1";
}

/// Fails every third refresh.
#[derive(Default)]
struct RefreshFeedHandler {
    calls: AtomicU32,
}

#[async_trait]
impl Handler<RefreshFeed> for RefreshFeedHandler {
    async fn handle(&self, task: RefreshFeed, ctx: WakeContext) -> Result<(), HandlerFailure> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 3 == 0 {
            return Err(HandlerFailure::new(format!("{} timed out", task.url)));
        }
        info!(url = %task.url, attempt = ctx.attempt, "feed refreshed");
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadLogs {
    bundle: String,
}

impl Task for UploadLogs {
    const HANDLER: &'static str = "logs.upload.v1";
}

struct UploadLogsHandler {
    remaining_failures: AtomicU32,
}

#[async_trait]
impl Handler<UploadLogs> for UploadLogsHandler {
    async fn handle(&self, task: UploadLogs, ctx: WakeContext) -> Result<(), HandlerFailure> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerFailure::new(format!(
                "upload of {} refused (left={left})",
                task.bundle
            )));
        }
        if ctx.is_cancelled() {
            return Err(HandlerFailure::cancelled());
        }
        info!(bundle = %task.bundle, attempt = ctx.attempt, "logs uploaded");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Simulate {
            config,
            store,
            hours,
            budget_secs,
        } => simulate(config, store, hours, Duration::from_secs(budget_secs)).await,
        Commands::Status { store } => status(store).await,
    }
}

async fn simulate(
    config_path: Option<PathBuf>,
    store: Option<PathBuf>,
    hours: u32,
    budget: Duration,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if store.is_some() {
        config.store.path = store;
    }

    let start = Utc::now();
    let end = start + TimeDelta::hours(i64::from(hours));
    let clock = Arc::new(FixedClock::new(start));
    let host = Arc::new(InMemoryHostScheduler::default());

    let bridge = BridgeBuilder::new(host.clone())
        .register::<RefreshFeed, _>(RefreshFeedHandler::default())?
        .register::<UploadLogs, _>(UploadLogsHandler {
            remaining_failures: AtomicU32::new(2),
        })?
        .expect_handlers(&[RefreshFeed::HANDLER, UploadLogs::HANDLER])
        .config(config)
        .clock(clock.clone())
        .build()
        .await?;
    let bridge = Arc::new(bridge);

    let refresh = TaskDefinition::for_task(
        TaskName::new("feed.refresh")?,
        &RefreshFeed {
            url: "https://example.com/feed.xml".to_string(),
        },
        Trigger::periodic(Duration::from_secs(15 * 60)),
    )?
    .requires_network()
    .build();
    let upload = TaskDefinition::for_task(
        TaskName::new("logs.upload")?,
        &UploadLogs {
            bundle: "crash-2024-01-01.tar.gz".to_string(),
        },
        Trigger::one_off_at(start + TimeDelta::minutes(5)),
    )?
    .requires_network()
    .requires_external_power()
    .max_retries(5)
    .build();

    for definition in [refresh, upload] {
        let registration = bridge.register_task(definition).await?;
        info!(?registration, "registered");
    }

    while let Some(due) = host.next_due() {
        if due > end {
            break;
        }
        clock.set(due.max(clock.now()));
        let now = clock.now();

        let mut wakes = JoinSet::new();
        for task in host.take_due(now) {
            let bridge = Arc::clone(&bridge);
            wakes.spawn(async move {
                let outcome = bridge.on_wake(&task, budget).await;
                (task, outcome)
            });
        }
        while let Some(joined) = wakes.join_next().await {
            let (task, outcome) = joined?;
            println!("{}  {:<14} {}", now.format("%H:%M:%S"), task, outcome);
        }
    }

    let counts = bridge.counts().await?;
    print_counts(&counts);
    if !bridge.shutdown().await {
        anyhow::bail!("handlers still running after shutdown grace");
    }
    Ok(())
}

async fn status(path: PathBuf) -> anyhow::Result<()> {
    let store = JsonFileStateStore::open(&path, Arc::new(SystemClock))
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let runs = store.list_all().await?;

    for run in &runs {
        let error = run
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{}  {:<14} {:<9} attempts={} due={} {}",
            run.id,
            run.task,
            format!("{:?}", run.state),
            run.attempt_count,
            run.scheduled_for.format("%Y-%m-%d %H:%M:%S"),
            error
        );
    }
    print_counts(&RunCounts::from_runs(&runs));
    Ok(())
}

fn print_counts(counts: &RunCounts) {
    println!(
        "pending={} retry_scheduled={} running={} succeeded={} failed={} cancelled={} awaiting_decision={}",
        counts.pending,
        counts.retry_scheduled,
        counts.running,
        counts.succeeded,
        counts.failed,
        counts.cancelled,
        counts.awaiting_decision
    );
}
