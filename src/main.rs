//! `folio` command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio::config::{PipelineConfig, APP_VERSION};
use folio::context::PipelineContext;
use folio::logging::init_logging;
use folio::pipeline::local::LocalDirectoryCatalog;
use folio::pipeline::statistics::render_table;
use folio::pipeline::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "folio",
    version,
    about = "Resumable recognition pipeline for scanned document corpora"
)]
struct Cli {
    /// Ledger database path
    #[arg(long, global = true, env = "FOLIO_DB")]
    db: Option<PathBuf>,

    /// Root for ledger, output, scratch and logs
    #[arg(long, global = true, env = "FOLIO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Worker threads for `process`
    #[arg(long, global = true, env = "FOLIO_WORKERS")]
    workers: Option<usize>,

    /// Debug logging for folio
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add new documents under a folder to the ledger
    Sync {
        /// Catalog root (defaults to the configured source directory)
        #[arg(long, env = "FOLIO_SOURCE_DIR")]
        source: Option<PathBuf>,
    },

    /// Process pending jobs until none are left
    Process {
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after dispatching this many jobs
        #[arg(long)]
        limit: Option<usize>,

        /// Catalog root the local fetcher reads from
        #[arg(long, env = "FOLIO_SOURCE_DIR")]
        source: Option<PathBuf>,
    },

    /// Requeue failed jobs whose backoff has elapsed
    Retry {
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Show ledger statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reset in-flight jobs left behind by a dead process
    Recover {
        /// Reset every in-flight job, even ones with a fresh heartbeat.
        /// Only safe when no other folio process uses this ledger.
        #[arg(long)]
        force: bool,
    },

    /// Quarantine a failed job for manual review
    Quarantine {
        file_id: String,

        #[arg(long, default_value = "manual review")]
        reason: String,
    },

    /// Show one job and its failure history as JSON
    Show { file_id: String },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let data_dir = cli.data_dir.clone();
    let mut config = PipelineConfig::from_lookup(|key| match (key, &data_dir) {
        ("FOLIO_DATA_DIR", Some(dir)) => Some(dir.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })
    .context("Invalid FOLIO_* environment")?;

    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    match &cli.command {
        Commands::Sync { source: Some(dir) } | Commands::Process { source: Some(dir), .. } => {
            config.source_dir = dir.clone();
        }
        _ => {}
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(command: Commands, config: PipelineConfig, token: &CancellationToken) -> Result<()> {
    match command {
        Commands::Sync { .. } => {
            let catalog = LocalDirectoryCatalog::new(&config.source_dir);
            let ctx = PipelineContext::ledger_only(config)?;
            let summary = ctx.sync_catalog(&catalog)?;
            println!("seen {} documents, {} new", summary.seen, summary.created);
        }
        Commands::Process { batch_size, limit, .. } => {
            let ctx = PipelineContext::new(config)?;
            let summary = ctx.process_pending(batch_size, limit, token)?;
            println!(
                "claimed {}: {} completed, {} quarantined, {} failed, {} released, {} abandoned in {:.1}s",
                summary.claimed,
                summary.completed,
                summary.quarantined,
                summary.failed,
                summary.released,
                summary.abandoned,
                summary.elapsed.as_secs_f64()
            );
        }
        Commands::Retry { max_retries } => {
            let ctx = PipelineContext::ledger_only(config)?;
            let summary = ctx.retry_failed(max_retries)?;
            println!(
                "scanned {}: {} requeued, {} waiting, {} exhausted, {} conflicts",
                summary.scanned,
                summary.requeued,
                summary.waiting,
                summary.exhausted,
                summary.conflicts
            );
        }
        Commands::Stats { json } => {
            let ctx = PipelineContext::ledger_only(config)?;
            let stats = ctx.statistics()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", render_table(&stats));
            }
        }
        Commands::Recover { force } => {
            let ctx = PipelineContext::ledger_only(config)?;
            let recovered = if force {
                ctx.force_recover()?
            } else {
                ctx.recover_orphans()?
            };
            println!("recovered {} jobs", recovered.len());
        }
        Commands::Quarantine { file_id, reason } => {
            let ctx = PipelineContext::ledger_only(config)?;
            let job = ctx.quarantine(&file_id, &reason)?;
            println!("{} is now {}", job.file_id, job.state);
        }
        Commands::Show { file_id } => {
            let ctx = PipelineContext::ledger_only(config)?;
            let job = ctx
                .job(&file_id)?
                .with_context(|| format!("No job for {file_id}"))?;
            let errors = ctx.job_errors(&file_id)?;
            let view = serde_json::json!({ "job": job, "errors": errors });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:?}");
            return ExitCode::from(2);
        }
    };

    let _log_guards = match init_logging(config.log_dir.as_deref(), cli.verbose) {
        Ok(guards) => Some(guards),
        Err(err) => {
            eprintln!("Warning: file logging disabled: {err}");
            init_logging(None, cli.verbose).ok()
        }
    };
    tracing::info!(version = APP_VERSION, command = ?cli.command, "folio starting");

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing current stages");
            signal_token.cancel();
        }
    });

    let command = cli.command;
    let result = tokio::task::spawn_blocking(move || run(command, config, &token))
        .await
        .context("Command task panicked")
        .and_then(|r| r);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            eprintln!("{err:?}");
            ExitCode::from(1)
        }
    }
}
