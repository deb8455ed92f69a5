//! AppHarvest - app store review harvester

use anyhow::{Context, Result};
use appharvest_common::env::{env_string, split_list};
use appharvest_common::logging::{init_logging, LogConfig, LogLevel};
use appharvest_ingest::config::HarvestConfig;
use appharvest_ingest::error::HarvestError;
use appharvest_ingest::framework::launcher::RUN_ID_ENV;
use appharvest_ingest::framework::{
    CategoryWorker, Orchestrator, ProcessLauncher, ProgressLedger, RecordSink, ResumableWorker,
    SystemProbe, WorkUnitStatus,
};
use appharvest_ingest::store::{MemoryStore, RecordStore, RestStore};
use appharvest_ingest::upstream::{HttpUpstream, UpstreamSource};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "appharvest")]
#[command(author, version, about = "Resumable app store review harvester")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run category workers under the resource-aware scheduler
    Orchestrate {
        /// Comma-separated categories (defaults to HARVEST_CATEGORIES or all)
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,

        #[arg(long)]
        min_concurrent: Option<usize>,

        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Stop launching after the first failed category
        #[arg(long)]
        strict: bool,

        /// Write to an in-memory store instead of the REST store
        #[arg(long)]
        dry_run: bool,
    },

    /// Harvest a single category (normally launched by `orchestrate`)
    Worker {
        #[arg(short, long)]
        category: String,

        #[arg(long)]
        memory_limit_mb: Option<u64>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Summarize the progress ledger
    Status {
        /// Only report this partition
        #[arg(short, long)]
        partition: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let guard = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("appharvest")
        .build()
        .merge_env()
        .and_then(|config| init_logging(&config));
    let _guard = match guard {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::from(2);
        },
    };

    match run(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            let code = e
                .downcast_ref::<HarvestError>()
                .map_or(1, HarvestError::exit_code);
            ExitCode::from(code as u8)
        },
    }
}

async fn run(command: Command) -> Result<u8> {
    match command {
        Command::Orchestrate {
            categories,
            min_concurrent,
            max_concurrent,
            strict,
            dry_run,
        } => {
            let mut config = HarvestConfig::from_env(dry_run)?;
            let categories: Vec<String> =
                categories.iter().flat_map(|c| split_list(c)).collect();
            if !categories.is_empty() {
                config.categories = categories;
            }
            if let Some(min) = min_concurrent {
                config.orchestrator.min_concurrent = min;
            }
            if let Some(max) = max_concurrent {
                config.orchestrator.max_concurrent = max;
            }
            config.orchestrator.strict |= strict;
            config.validate()?;
            orchestrate(config).await
        },
        Command::Worker {
            category,
            memory_limit_mb,
            dry_run,
        } => {
            let mut config = HarvestConfig::from_env(dry_run)?;
            if let Some(limit) = memory_limit_mb {
                config.worker.memory_limit_mb = limit;
            }
            harvest_category(config, &category).await
        },
        Command::Status { partition } => {
            let config = HarvestConfig::from_env(true)?;
            status(&config, partition.as_deref())
        },
    }
}

/// Cancel the returned token on Ctrl-C or SIGTERM
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                },
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                },
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => warn!("Interrupt received, shutting down gracefully"),
            _ = terminate => warn!("Terminate signal received, shutting down gracefully"),
        }
        trigger.cancel();
    });
    token
}

async fn orchestrate(config: HarvestConfig) -> Result<u8> {
    let ledger = Arc::new(ProgressLedger::open(
        &config.ledger_dir,
        config.worker.max_records_per_unit,
    )?);
    let run_id = Uuid::new_v4();
    let launcher = ProcessLauncher::current_exe(config.worker.memory_limit_mb)?
        .with_dry_run(config.dry_run)
        .with_run_id(run_id);

    info!(
        run_id = %run_id,
        categories = config.categories.len(),
        dry_run = config.dry_run,
        ledger_dir = %config.ledger_dir.display(),
        "Starting orchestrator"
    );

    let mut orchestrator = Orchestrator::new(
        Arc::new(launcher),
        Arc::new(SystemProbe::new()),
        ledger,
        config.orchestrator.clone(),
    );
    let summary = orchestrator
        .run(&config.categories, shutdown_signal())
        .await?;

    Ok(summary.exit_code() as u8)
}

async fn harvest_category(config: HarvestConfig, category: &str) -> Result<u8> {
    let store: Arc<dyn RecordStore> = if config.dry_run {
        info!("Dry run: records go to an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let (Some(url), Some(key)) = (&config.store.url, &config.store.api_key) else {
            return Err(HarvestError::FatalConfig("store credentials missing".to_string()).into());
        };
        Arc::new(RestStore::new(url, key, config.store.timeout).map_err(HarvestError::from)?)
    };

    let upstream: Arc<dyn UpstreamSource> = Arc::new(
        HttpUpstream::new(
            &config.upstream.url,
            &config.worker.language,
            &config.worker.country,
            config.upstream.timeout,
        )
        .map_err(HarvestError::from)?
        .with_page_size(config.upstream.page_size),
    );

    let ledger = Arc::new(ProgressLedger::open(
        &config.ledger_dir,
        config.worker.max_records_per_unit,
    )?);
    let worker = ResumableWorker::new(
        Arc::clone(&upstream),
        RecordSink::new(store, config.sink.clone()),
        Arc::clone(&ledger),
        Arc::new(SystemProbe::new()),
        config.worker.clone(),
    );
    let category_worker = CategoryWorker::new(upstream, worker, ledger, config.throttle.clone())
        .with_metadata(config.collect_metadata)
        .with_ranks(config.rank_collection.clone())
        .with_store_check(config.skip_stored_apps);

    let run_id = env_string(RUN_ID_ENV).unwrap_or_else(|| "standalone".to_string());
    let summary = category_worker
        .run(category, &shutdown_signal())
        .instrument(info_span!("worker", run_id = %run_id, category))
        .await
        .with_context(|| format!("Category {category} failed"))?;

    if summary.interrupted {
        warn!(category, "Worker paused; progress saved for resume");
    }
    Ok(if summary.success() { 0 } else { 1 })
}

fn status(config: &HarvestConfig, only: Option<&str>) -> Result<u8> {
    let ledger = ProgressLedger::open(&config.ledger_dir, config.worker.max_records_per_unit)?;
    let partitions = ledger.load_all()?;

    if partitions.is_empty() {
        println!("No progress recorded in {}", config.ledger_dir.display());
        return Ok(0);
    }

    println!(
        "{:<28} {:>9} {:>11} {:>7} {:>8} {:>10}",
        "PARTITION", "COMPLETED", "IN_PROGRESS", "FAILED", "PENDING", "RECORDS"
    );
    for (partition, units) in &partitions {
        if only.is_some_and(|p| p != partition) {
            continue;
        }
        let count = |status: WorkUnitStatus| units.values().filter(|r| r.status == status).count();
        let records: u64 = units.values().map(|r| r.records_so_far).sum();
        println!(
            "{:<28} {:>9} {:>11} {:>7} {:>8} {:>10}",
            partition,
            count(WorkUnitStatus::Completed),
            count(WorkUnitStatus::InProgress),
            count(WorkUnitStatus::Failed),
            count(WorkUnitStatus::Pending),
            records
        );
    }
    Ok(0)
}
