use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use gauged::aggregate::Aggregator;
use gauged::config::Config;
use gauged::ingest::{self, IngestState};
use gauged::migrate::{Migrator, PgMigrator};
use gauged::store::Store;
use gauged::worker::FlushWorker;

/// Metric aggregation daemon: buffers collector samples, rolls them up
/// once a minute, and persists the results to PostgreSQL.
#[derive(Parser)]
#[command(name = "gauged", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregation daemon (the default).
    Run,

    /// Manage the database schema.
    Migrate {
        #[command(subcommand)]
        direction: MigrateCommand,
    },

    /// Compact historical rows into coarser buckets.
    Compact(CompactArgs),

    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show the current schema version.
    Status,
}

#[derive(Args)]
struct CompactArgs {
    /// Preset: compact rows between 7 and 30 days old with 30m buckets.
    #[arg(long, conflicts_with_all = ["monthly", "older_than", "max_age", "period"])]
    weekly: bool,

    /// Preset: compact rows older than 30 days with 2h buckets.
    #[arg(long, conflicts_with_all = ["weekly", "older_than", "max_age", "period"])]
    monthly: bool,

    /// Compact rows older than this age (e.g. "7d").
    #[arg(long, value_parser = humantime::parse_duration)]
    older_than: Option<Duration>,

    /// Leave rows older than this age alone (e.g. "30d").
    #[arg(long, value_parser = humantime::parse_duration)]
    max_age: Option<Duration>,

    /// Bucket period (e.g. "30m").
    #[arg(long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Do all the work but roll back instead of committing.
    #[arg(long)]
    dry_run: bool,

    /// Vacuum the tsd table after a fully successful compaction.
    #[arg(long)]
    vacuum: bool,

    /// Use VACUUM FULL instead of plain VACUUM (implies --vacuum).
    #[arg(long)]
    full: bool,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("gauged {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => rt.block_on(run(cfg)),
        Command::Migrate { direction } => rt.block_on(run_migrate(cfg, direction)),
        Command::Compact(args) => rt.block_on(run_compact(cfg, args)),
        Command::Version => unreachable!("handled above"),
    }
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting gauged",
    );

    let store = Store::connect(&cfg.db).await?;
    let aggregator = Arc::new(Aggregator::new(cfg.rollups.clone()));

    let cancel = CancellationToken::new();

    // Set up signal handling.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }

            cancel.cancel();
        });
    }

    let worker = FlushWorker::new(Arc::clone(&aggregator), store, cancel.child_token());
    let worker_handle = tokio::spawn(worker.run());

    let state = Arc::new(IngestState {
        aggregator,
        users: cfg.ingest.users.clone(),
    });
    ingest::serve(&cfg.ingest.listen, state, cancel.child_token()).await?;

    // The server has drained; let the worker finish its cycle.
    worker_handle.await.context("joining flush worker")?;

    tracing::info!("gauged stopped");

    Ok(())
}

async fn run_migrate(cfg: Config, direction: MigrateCommand) -> Result<()> {
    let migrator = PgMigrator::connect(&cfg.db).await?;

    match direction {
        MigrateCommand::Up => migrator.up().await,
        MigrateCommand::Down => migrator.down().await,
        MigrateCommand::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
            Ok(())
        }
    }
}

async fn run_compact(cfg: Config, args: CompactArgs) -> Result<()> {
    let (older_than, max_age, period) = compaction_window(&args)?;

    let now = Utc::now().naive_utc();
    let start = now - chrono::Duration::from_std(older_than).context("older-than out of range")?;
    let end = match max_age {
        Some(age) => now - chrono::Duration::from_std(age).context("max-age out of range")?,
        None => chrono::DateTime::<Utc>::UNIX_EPOCH.naive_utc(),
    };
    let period_secs = period.as_secs() as i64;

    tracing::info!(
        %start,
        %end,
        period_secs,
        dry_run = args.dry_run,
        "starting compaction",
    );

    let mut store = Store::connect(&cfg.db).await?;
    let series = store.list_series(start, end).await?;
    tracing::info!(series = series.len(), "discovered series to compact");

    let mut failures = 0u32;
    for (entity_id, key_id) in series {
        if let Err(e) = store
            .run_compaction(entity_id, key_id, start, period_secs, end, args.dry_run)
            .await
        {
            tracing::error!(entity_id, key_id, error = %e, "series skipped");
            failures += 1;
        }
    }

    if args.vacuum || args.full {
        if failures > 0 {
            tracing::warn!(failures, "skipping vacuum after compaction failures");
        } else {
            store.vacuum("tsd", args.full, args.dry_run).await?;
        }
    }

    if failures > 0 {
        bail!("{failures} series failed to compact");
    }

    Ok(())
}

/// Resolves the compaction window from a preset or explicit arguments.
fn compaction_window(args: &CompactArgs) -> Result<(Duration, Option<Duration>, Duration)> {
    const DAY: u64 = 24 * 60 * 60;

    if args.weekly {
        return Ok((
            Duration::from_secs(7 * DAY),
            Some(Duration::from_secs(30 * DAY)),
            Duration::from_secs(30 * 60),
        ));
    }

    if args.monthly {
        return Ok((
            Duration::from_secs(30 * DAY),
            None,
            Duration::from_secs(2 * 60 * 60),
        ));
    }

    let older_than = args
        .older_than
        .context("--older-than is required without --weekly or --monthly")?;
    let period = args
        .period
        .context("--period is required without --weekly or --monthly")?;

    if period.as_secs() == 0 {
        bail!("--period must be at least one second");
    }
    if let Some(max_age) = args.max_age {
        if max_age <= older_than {
            bail!("--max-age must be greater than --older-than");
        }
    }

    Ok((older_than, args.max_age, period))
}
