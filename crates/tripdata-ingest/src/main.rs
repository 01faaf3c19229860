//! Tripdata Ingest - chunked bulk loader for NYC taxi trip records

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::PgPool;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tripdata_common::logging::{init_logging, LogConfig, LogLevel};
use tripdata_common::YearMonth;
use tripdata_ingest::config::IngestConfig;
use tripdata_ingest::framework::storage::SourceLocator;
use tripdata_ingest::framework::{
    partitions_between, BackfillDriver, BackfillReport, Partition, PartitionOrchestrator,
    PartitionStatus, Service,
};
use tripdata_ingest::postgres::{stage_jsonl, PgLineageLedger, PgStagingArea, PgWarehouse};
use tripdata_ingest::probe::HttpSourceProbe;
use tripdata_ingest::{db, profile};

/// Probes in flight at once
const PROBE_CONCURRENCY: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "tripdata-ingest")]
#[command(author, version, about = "Chunked idempotent loader for NYC taxi trip records")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Stage a JSON lines export of one partition's source file
    Stage {
        #[arg(long)]
        service: Service,

        /// Month as YYYY-MM
        #[arg(long)]
        month: YearMonth,

        /// JSON lines file, one record object per line
        #[arg(long)]
        file: PathBuf,
    },

    /// Load a single partition
    Load {
        /// Dataset profile name (see `profiles`)
        #[arg(long)]
        profile: String,

        /// Month as YYYY-MM
        #[arg(long)]
        month: YearMonth,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Load every month of an inclusive range
    Backfill {
        #[arg(long)]
        profile: String,

        /// First month, YYYY-MM
        #[arg(long)]
        from: YearMonth,

        /// Last month, YYYY-MM
        #[arg(long)]
        to: YearMonth,

        /// Partitions loaded at once
        #[arg(long)]
        concurrency: Option<usize>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Report which source objects are published remotely
    Probe {
        #[arg(long)]
        service: Service,

        #[arg(long)]
        from: YearMonth,

        #[arg(long)]
        to: YearMonth,
    },

    /// Print the built-in dataset profiles
    Profiles,
}

/// Flags that take precedence over `INGEST_*` variables
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Rows per chunk
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Total attempts per chunk
    #[arg(long)]
    max_retries: Option<u32>,

    /// Base backoff delay in seconds
    #[arg(long)]
    backoff_secs: Option<u64>,

    /// Wall-clock budget per partition in seconds
    #[arg(long)]
    partition_timeout_secs: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(v) = self.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = self.max_retries {
            config.max_attempts = v;
        }
        if let Some(v) = self.backoff_secs {
            config.backoff_secs = v;
        }
        if let Some(v) = self.partition_timeout_secs {
            config.partition_timeout_secs = Some(v);
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeEntry {
    partition: String,
    url: String,
    exists: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _guard = init_logging(&log_config(cli.verbose)?)?;

    let mut config = IngestConfig::from_env()?;

    match cli.command {
        Command::Migrate => {
            config.validate()?;
            let pool = connect(&config).await?;
            db::migrate(&pool).await?;
            info!("Migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stage {
            service,
            month,
            file,
        } => {
            config.validate()?;
            let pool = connect(&config).await?;
            let report = stage_jsonl(&pool, &Partition::new(service, month), &file).await?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Load {
            profile,
            month,
            overrides,
        } => {
            overrides.apply(&mut config);
            config.validate()?;
            let profile = resolve_profile(&profile)?;
            let partition = Partition::new(profile.service, month);
            let report = run_backfill(&config, profile, vec![partition], 1).await?;
            match report.outcomes.first() {
                Some(outcome) => print_json(outcome)?,
                None => bail!("no outcome produced for {}", partition),
            }
            Ok(exit_code(&report))
        }
        Command::Backfill {
            profile,
            from,
            to,
            concurrency,
            overrides,
        } => {
            overrides.apply(&mut config);
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            config.validate()?;
            if from > to {
                bail!("--from {} is after --to {}", from, to);
            }
            let profile = resolve_profile(&profile)?;
            let partitions = partitions_between(profile.service, from, to);
            let concurrency = config.concurrency;
            let report = run_backfill(&config, profile, partitions, concurrency).await?;
            print_json(&report)?;
            Ok(exit_code(&report))
        }
        Command::Probe { service, from, to } => {
            config.validate()?;
            let probe = HttpSourceProbe::new(
                config.source_base_url.clone(),
                config.probe_timeout(),
                config.probe_retry_policy(),
            )?;

            let probe = &probe;
            let entries: Vec<ProbeEntry> = stream::iter(partitions_between(service, from, to))
                .map(|partition| async move {
                    let exists = probe.exists(&partition).await?;
                    Ok::<_, tripdata_ingest::IngestError>(ProbeEntry {
                        partition: partition.to_string(),
                        url: probe.object_url(&partition),
                        exists,
                    })
                })
                .buffered(PROBE_CONCURRENCY)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<std::result::Result<_, _>>()?;

            print_json(&entries)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Profiles => {
            print_json(&profile::builtin_profiles())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `LOG_*` variables first, then `-v` on top
fn log_config(verbose: bool) -> Result<LogConfig> {
    let mut config = LogConfig::builder()
        .log_file_prefix("tripdata-ingest")
        .filter_directives("sqlx=warn")
        .build()
        .merge_env()?;
    if verbose {
        config.level = LogLevel::Debug;
    }
    Ok(config)
}

async fn connect(config: &IngestConfig) -> Result<PgPool> {
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to the database")?;
    db::health_check(&pool).await?;
    Ok(pool)
}

fn resolve_profile(name: &str) -> Result<profile::DatasetProfile> {
    profile::find_builtin(name).with_context(|| {
        let known: Vec<String> = profile::builtin_profiles()
            .into_iter()
            .map(|p| p.name)
            .collect();
        format!("unknown profile '{}' (available: {})", name, known.join(", "))
    })
}

async fn run_backfill(
    config: &IngestConfig,
    profile: profile::DatasetProfile,
    partitions: Vec<Partition>,
    concurrency: usize,
) -> Result<BackfillReport> {
    let pool = connect(config).await?;
    let staging = Arc::new(PgStagingArea::new(pool.clone()));
    let orchestrator = Arc::new(PartitionOrchestrator::new(
        staging.clone(),
        staging,
        Arc::new(PgWarehouse::new(pool.clone())),
        Arc::new(PgLineageLedger::new(pool)),
        config.orchestrator(),
    ));

    let driver = BackfillDriver::new(orchestrator, profile)
        .with_concurrency(concurrency)
        .with_partition_timeout(config.partition_timeout());
    Ok(driver.run(partitions).await)
}

/// 2 when a run could not be recorded, 1 when a partition failed, else 0
fn exit_code(report: &BackfillReport) -> ExitCode {
    if !report.operational_failures().is_empty() {
        ExitCode::from(2)
    } else if report.count(PartitionStatus::Failed) > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_flag_overrides_log_level_variable() {
        std::env::set_var("LOG_LEVEL", "warn");
        let quiet = log_config(false).unwrap();
        let verbose = log_config(true).unwrap();
        std::env::remove_var("LOG_LEVEL");

        assert_eq!(quiet.level, LogLevel::Warn);
        assert_eq!(verbose.level, LogLevel::Debug);
    }
}
