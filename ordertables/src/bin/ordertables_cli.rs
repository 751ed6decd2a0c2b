use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use ordertables::OrderTables;
use ordertables::config::StorageConfig;
use ordertables::mapping::EntityType;
use ordertables::models::JobStatus;

#[derive(Parser, Debug)]
#[command(
    name = "ordertables-cli",
    about = "Move orders and refunds between legacy metadata and relational tables."
)]
struct Cli {
    /// Directory holding the order tables database.
    #[arg(short, long, default_value = ".", value_hint = clap::ValueHint::DirPath)]
    base_path: PathBuf,

    /// JSON configuration file; takes precedence over --base-path.
    #[arg(short, long, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Minimum log level to display.
    #[arg(long, default_value_t = LogLevelArg::Info, value_enum)]
    log_level: LogLevelArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count entities still waiting for migration.
    Count {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,
    },
    /// Copy legacy entities into the relational tables, resuming where the last run stopped.
    Migrate {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,

        /// Entities per batch (defaults to the configured batch size).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many batches; the job stays resumable.
        #[arg(long)]
        max_batches: Option<usize>,
    },
    /// Write relational rows back into legacy metadata.
    Backfill {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,

        /// Entities per batch (defaults to the configured batch size).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Ask a running job to stop after its current batch.
    Pause {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,

        /// Target the backfill job instead of the migration.
        #[arg(long)]
        backfill: bool,
    },
    /// Show job state, cursor and counters.
    Status {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,

        #[arg(long)]
        backfill: bool,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List entities that failed during the latest runs.
    Failures {
        #[arg(long, value_enum, default_value_t = EntityArg::Order)]
        entity: EntityArg,

        #[arg(long)]
        backfill: bool,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LevelFilter {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Error => LevelFilter::Error,
            LogLevelArg::Warn => LevelFilter::Warn,
            LogLevelArg::Info => LevelFilter::Info,
            LogLevelArg::Debug => LevelFilter::Debug,
            LogLevelArg::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EntityArg {
    Order,
    Refund,
}

impl From<EntityArg> for EntityType {
    fn from(value: EntityArg) -> Self {
        match value {
            EntityArg::Order => EntityType::Order,
            EntityArg::Refund => EntityType::Refund,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default());
    logger.filter_level(LevelFilter::from(cli.log_level));
    let _ = logger.try_init();

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("failed to load .env");
        }
    }

    let config = match &cli.config {
        Some(path) => StorageConfig::from_json_file(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?,
        None => {
            if !cli.base_path.exists() {
                bail!("Base path '{}' does not exist", cli.base_path.display());
            }
            StorageConfig::new(&cli.base_path)
        }
    };
    let config = config
        .with_env_overrides()
        .context("invalid ORDER_TABLES_* environment override")?;
    let default_batch = config.batch_size;

    let tables = OrderTables::open(config).context("failed to open order tables")?;

    match cli.command {
        Commands::Count { entity } => {
            let entity = EntityType::from(entity);
            let pending = tables.migration(entity).pending_count()?;
            println!(
                "{} pending migration ({} legacy, {} relational)",
                pending,
                tables.legacy.count(entity)?,
                tables.relational.count(entity)?
            );
            Ok(())
        }
        Commands::Migrate {
            entity,
            batch_size,
            max_batches,
        } => {
            let driver = tables.migration(entity.into());
            let status = driver
                .run_batches(batch_size.unwrap_or(default_batch), max_batches)
                .with_context(|| format!("{} did not finish", driver.key()))?;
            print_status(&status);
            Ok(())
        }
        Commands::Backfill { entity, batch_size } => {
            let driver = tables.backfill(entity.into());
            let status = driver
                .start(batch_size.unwrap_or(default_batch))
                .with_context(|| format!("{} did not finish", driver.key()))?;
            print_status(&status);
            Ok(())
        }
        Commands::Pause { entity, backfill } => {
            let requested = if backfill {
                tables.backfill(entity.into()).pause()?
            } else {
                tables.migration(entity.into()).pause()?
            };
            if requested {
                println!("Pause requested; the job stops after its current batch.");
            } else {
                println!("Job is not running.");
            }
            Ok(())
        }
        Commands::Status {
            entity,
            backfill,
            json,
        } => {
            let status = if backfill {
                tables.backfill(entity.into()).status()?
            } else {
                tables.migration(entity.into()).status()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            Ok(())
        }
        Commands::Failures {
            entity,
            backfill,
            json,
        } => {
            let failures = if backfill {
                tables.backfill(entity.into()).failures()?
            } else {
                tables.migration(entity.into()).failures()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&failures)?);
            } else if failures.is_empty() {
                println!("No failures recorded.");
            } else {
                println!("{:<12} {:<20} CAUSE", "ENTITY", "RECORDED AT");
                for failure in failures {
                    let recorded = chrono::DateTime::from_timestamp(failure.recorded_at, 0)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| failure.recorded_at.to_string());
                    println!("{:<12} {:<20} {}", failure.entity_id, recorded, failure.cause);
                }
            }
            Ok(())
        }
    }
}

fn print_status(status: &JobStatus) {
    let c = &status.counters;
    println!("Job:        {}", status.key);
    println!("State:      {}", status.state);
    println!("Cursor:     {}", status.cursor);
    println!("Batch size: {}", status.batch_size);
    println!(
        "Counters:   {} attempted, {} migrated, {} skipped, {} failed",
        c.attempted, c.migrated, c.skipped, c.failed
    );
    if status.pause_requested {
        println!("Pause requested.");
    }
}
