use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use evalstore::collector::Merger;
use evalstore::config::Config;
use evalstore::export::StoreMetrics;
use evalstore::store::{Backend, OutcomeReducer, Progress, StatsQuery};

/// Maintenance tool for a shared benchmark result store.
#[derive(Parser)]
#[command(name = "evalstore", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the store directory from the configuration.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides the config's
    /// `log_level`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Ingest staging files until SIGINT/SIGTERM, then run a final cycle.
    Merge,
    /// Fold columnar incremental side files into the shared table.
    Consolidate,
    /// Fold columnar recovery files into the shared table.
    Replay,
    /// Print matching statistics as JSON.
    Query {
        model: String,
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        reliability: Option<f64>,
        #[arg(long)]
        difficulty: Option<String>,
        #[arg(long)]
        task_type: Option<String>,
    },
    /// Print how many tests a model has recorded against a target, as JSON.
    Progress { model: String, target: u64 },
}

/// Build-time version info, injected via build.rs.
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
    if let Command::Version = &cli.command {
        println!("evalstore {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
        cfg.validate().context("validating config")?;
    }

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    // Logs go to stderr so query output stays machine-readable.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        data_dir = %cfg.data_dir.display(),
        "starting evalstore",
    );

    let metrics = Arc::new(StoreMetrics::new().context("creating store metrics")?);
    let reducer = OutcomeReducer::from_config(&cfg).context("building outcome reducer")?;
    let backend = Backend::open(&cfg, reducer, Arc::clone(&metrics))
        .with_context(|| format!("opening {} store", cfg.backend.as_str()))?;

    match cli.command {
        Command::Version => Ok(()),
        Command::Merge => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            rt.block_on(run_merger(cfg, backend, metrics))
        }
        Command::Consolidate => {
            let Backend::Columnar(store) = &backend else {
                bail!("consolidate requires the columnar backend");
            };
            let report = store.consolidate().context("consolidating side files")?;
            println!(
                "folded {} incremental files ({} already ingested, {} quarantined)",
                report.folded, report.stale, report.quarantined
            );
            Ok(())
        }
        Command::Replay => {
            let Backend::Columnar(store) = &backend else {
                bail!("replay requires the columnar backend");
            };
            // Opening the store already replays; this picks up files spilled since.
            let report = store.replay_recovery().context("replaying recovery files")?;
            let rows = store.table().context("reading summary table")?.len();
            println!("folded {} recovery files, table has {rows} rows", report.folded);
            Ok(())
        }
        Command::Query {
            model,
            variant,
            reliability,
            difficulty,
            task_type,
        } => {
            let mut query = StatsQuery::model(model);
            if let Some(v) = variant {
                query = query.prompt_variant(v);
            }
            if let Some(r) = reliability {
                query = query.tool_reliability(r);
            }
            if let Some(d) = difficulty {
                query = query.difficulty(d);
            }
            if let Some(t) = task_type {
                query = query.task_type(t);
            }
            let mut stats = backend.query(&query).context("querying store")?;
            stats.sort_by(|a, b| a.key.cmp(&b.key));
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Progress { model, target } => {
            let stats = backend
                .query(&StatsQuery::model(model))
                .context("querying store")?;
            let progress = Progress::from_stats(&stats, target);
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
    }
}

async fn run_merger(cfg: Config, backend: Backend, metrics: Arc<StoreMetrics>) -> Result<()> {
    let paths = cfg.paths();
    let Some(merger) = Merger::try_elect(&paths, &cfg.merger, backend, metrics)
        .context("electing merger")?
    else {
        bail!(
            "another merger already holds {}",
            paths.merger_lock.display()
        );
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::new(merger).run(cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
    task.await.context("merger task failed")?;

    tracing::info!("evalstore merger stopped");

    Ok(())
}
