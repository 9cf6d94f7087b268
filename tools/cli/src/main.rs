//! Offsync CLI - operator interface for the reconciliation engine.
//!
//! Enqueue mutations, run batches, inspect the queue and settle conflicts
//! against a local SQLite database.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use offsync_common::{ConflictId, ItemId};
use offsync_sync::{
    BatchReport, ConflictRecord, ItemStatus, MutationIntent, Operation, Resolution, SyncEngine,
    SyncMode, SyncQueueItem, SyncScheduler,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - offline mutation reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the config file.
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a client mutation for later replay.
    Enqueue {
        /// Owning client or user.
        #[arg(short, long)]
        owner: String,

        /// Target table.
        #[arg(short, long)]
        table: String,

        /// Target record identifier.
        #[arg(short, long)]
        record: String,

        /// "insert", "update" or "delete".
        #[arg(long)]
        operation: Operation,

        /// Record fields as a JSON object.
        #[arg(short, long)]
        payload: Option<String>,

        /// Record version the client observed.
        #[arg(long)]
        version: Option<u64>,
    },

    /// Replay one batch of pending mutations.
    Process {
        /// Items to take (default: configured batch size).
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// List unresolved conflicts for an owner.
    Conflicts {
        #[arg(short, long)]
        owner: String,
    },

    /// Resolve a conflict.
    Resolve {
        /// Conflict identifier.
        conflict: ConflictId,

        /// "client-wins", "server-wins" or "manual".
        resolution: Resolution,
    },

    /// Re-arm items stuck in processing.
    Reclaim {
        /// Minimum claim age in seconds (default: configured threshold).
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Show queue counts by status.
    Stats,

    /// List queue items.
    List {
        /// Only items with this status.
        #[arg(short, long)]
        status: Option<ItemStatus>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one queue item, or one conflict with --conflict.
    Show {
        id: String,

        #[arg(long)]
        conflict: bool,
    },

    /// Process batches on a timer until interrupted.
    Run {
        /// Seconds between batches (default: configured poll interval).
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "offsync", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    let engine = config.open_engine().await?;
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Enqueue {
            owner,
            table,
            record,
            operation,
            payload,
            version,
        } => cmd_enqueue(&engine, &out, owner, table, record, operation, payload, version).await,

        Commands::Process { batch_size } => {
            let size = batch_size.unwrap_or(engine.config().batch_size);
            let report = engine.process_batch(size).await?;
            out.report(&report)
        }

        Commands::Conflicts { owner } => {
            let conflicts = engine.list_conflicts(&owner).await?;
            out.conflicts(&conflicts)
        }

        Commands::Resolve {
            conflict,
            resolution,
        } => {
            let resolved = engine
                .resolve_conflict(conflict, resolution)
                .await
                .with_context(|| format!("Failed to resolve conflict {}", conflict))?;
            out.conflicts(std::slice::from_ref(&resolved))
        }

        Commands::Reclaim { older_than } => {
            let reclaimed = match older_than {
                Some(secs) => engine.reclaim_older_than(Duration::from_secs(secs)).await?,
                None => engine.reclaim_stale().await?,
            };
            out.value(&reclaimed, || format!("Reclaimed {} items", reclaimed))
        }

        Commands::Stats => {
            let stats = engine.stats().await?;
            out.value(&stats, || {
                format!(
                    "pending: {}\nprocessing: {}\ncompleted: {}\nfailed: {}\nconflicted: {}",
                    stats.pending, stats.processing, stats.completed, stats.failed, stats.conflicted
                )
            })
        }

        Commands::List { status, limit } => {
            let items = engine.list_items(status, limit).await?;
            out.items(&items)
        }

        Commands::Show { id, conflict } => {
            if conflict {
                let id: ConflictId = id.parse().context("Invalid conflict id")?;
                let record = engine.get_conflict(id).await?;
                out.conflicts(std::slice::from_ref(&record))
            } else {
                let id: ItemId = id.parse().context("Invalid item id")?;
                let item = engine.get_item(id).await?;
                out.items(std::slice::from_ref(&item))?;
                match engine.conflict_for_item(id).await? {
                    Some(conflict) if !out.json => out.conflicts(std::slice::from_ref(&conflict)),
                    _ => Ok(()),
                }
            }
        }

        Commands::Run { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| engine.config().poll_interval());
            cmd_run(engine, interval).await
        }

        Commands::Completions { .. } => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_enqueue(
    engine: &SyncEngine,
    out: &Output,
    owner: String,
    table: String,
    record: String,
    operation: Operation,
    payload: Option<String>,
    version: Option<u64>,
) -> Result<()> {
    let payload = payload
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .context("Payload is not valid JSON")?;

    let mut intent = MutationIntent::new(owner, table, record, operation, payload);
    if let Some(version) = version {
        intent = intent.with_version(version);
    }

    let item = engine
        .enqueue(intent)
        .await
        .context("Failed to enqueue mutation")?;
    out.items(std::slice::from_ref(&item))
}

/// Run periodic batches until Ctrl-C.
async fn cmd_run(engine: SyncEngine, interval: Duration) -> Result<()> {
    info!("Processing batches every {:?}; press Ctrl-C to stop", interval);

    let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic { interval });
    let worker = engine.clone();
    let task = tokio::spawn(async move {
        handle
            .run(move |request| {
                let engine = worker.clone();
                async move { engine.process_request(request).await }
            })
            .await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    let stats = engine.stats().await?;
    info!(
        "Stopped with {} pending, {} conflicted",
        stats.pending, stats.conflicted
    );
    Ok(())
}

/// Prints results as JSON or short text lines.
struct Output {
    json: bool,
}

impl Output {
    fn value<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }

    fn report(&self, report: &BatchReport) -> Result<()> {
        self.value(report, || {
            format!(
                "applied: {}, conflicted: {}, failed: {}, skipped: {}, timed out: {}, reclaimed: {} ({:?})",
                report.applied,
                report.conflicted,
                report.failed,
                report.skipped,
                report.timed_out,
                report.reclaimed,
                report.duration
            )
        })
    }

    fn items(&self, items: &[SyncQueueItem]) -> Result<()> {
        self.value(&items, || {
            if items.is_empty() {
                return "No items.".to_string();
            }
            items
                .iter()
                .map(|item| {
                    let mut line = format!(
                        "{}  {:<10} {} {}/{} ({})",
                        item.id,
                        item.status,
                        item.operation,
                        item.table_name,
                        item.record_id,
                        item.owner_id
                    );
                    if let Some(error) = &item.last_error {
                        line.push_str(&format!("\n    error: {}", error));
                    }
                    line
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn conflicts(&self, conflicts: &[ConflictRecord]) -> Result<()> {
        self.value(&conflicts, || {
            if conflicts.is_empty() {
                return "No conflicts.".to_string();
            }
            conflicts
                .iter()
                .map(|conflict| {
                    let state = conflict
                        .resolution
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unresolved".to_string());
                    format!(
                        "{}  {} {}/{}: {} [{}]",
                        conflict.id,
                        conflict.operation,
                        conflict.table_name,
                        conflict.record_id,
                        conflict.reason,
                        state
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }
}
