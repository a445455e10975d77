use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kitchen_sync::config::{Config, StorageConfig};
use kitchen_sync::queue::{EntityType, OperationRecord};
use kitchen_sync::storage::{DurableStores, OperationJournal};
use kitchen_sync::sync_log::{SyncLogEntry, SyncLogFilter, SyncLogStore, SyncStatus};

/// Plain-text log file that starts over (keeping one `.1` backup) once it
/// grows past `max_size` bytes.
struct LogFile {
    path: String,
    max_size: u64,
    file: File,
    written: u64,
}

impl LogFile {
    fn open(path: String, max_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            file,
            written,
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn init_logging() {
    if let Ok(path) = std::env::var("KITCHEN_SYNC_LOG_FILE") {
        // Plain logs go to the file through env_logger; no tracing layer.
        let max_size_mb = std::env::var("KITCHEN_SYNC_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10);

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        match LogFile::open(path.clone(), max_size_mb * 1024 * 1024) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open log file {path}: {e}; logging to stderr"),
        }
        let _ = builder.try_init();
        return;
    }

    let _ = LogTracer::init();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(true).with_writer(io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "kitchen-sync")]
#[command(about = "Inspect the durable state of the kitchen point-of-sale sync queue")]
struct Cli {
    /// JSON config file
    #[arg(short, long, env = "KITCHEN_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Sled data directory; overrides the configured storage
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sync log entries, newest first
    Log {
        #[arg(long)]
        owner: Option<String>,

        /// catalog_item, employee, recipe_cost or ingredient_cost
        #[arg(long)]
        entity_type: Option<EntityType>,

        #[arg(long)]
        entity_id: Option<String>,

        /// success or error
        #[arg(long)]
        status: Option<SyncStatus>,

        /// Only entries at or after this time (ms since epoch)
        #[arg(long)]
        since_ms: Option<u64>,

        /// Only entries at or before this time (ms since epoch)
        #[arg(long)]
        until_ms: Option<u64>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// List journaled operations that have not finished yet
    Pending {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

fn data_dir_of(config: &Config) -> Result<&str> {
    match &config.storage {
        StorageConfig::Sled { data_dir } => Ok(data_dir),
        StorageConfig::Memory => {
            bail!("no data directory: pass --data-dir or set KITCHEN_SYNC_DATA_DIR")
        }
    }
}

fn print_entries(entries: &[SyncLogEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(io::stdout());
            wtr.write_record([
                "timestamp_ms",
                "owner_id",
                "operation_type",
                "direction",
                "entity_type",
                "entity_id",
                "status",
                "retry_count",
                "error_message",
            ])?;
            for e in entries {
                let retry_count = e
                    .error_details
                    .as_ref()
                    .map(|d| d.retry_count.to_string())
                    .unwrap_or_default();
                wtr.write_record([
                    e.timestamp_ms.to_string(),
                    e.owner_id.clone(),
                    e.operation_type.clone(),
                    e.direction.to_string(),
                    e.entity_type.to_string(),
                    e.entity_id.clone(),
                    e.status.as_str().to_string(),
                    retry_count,
                    e.error_message.clone().unwrap_or_default(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            println!(
                "{:<15} {:<12} {:<16} {:<20} {:<8} {:<7} ERROR",
                "TIMESTAMP_MS", "OWNER", "ENTITY_TYPE", "ENTITY_ID", "STATUS", "RETRIES"
            );
            for e in entries {
                let retries = e
                    .error_details
                    .as_ref()
                    .map(|d| d.retry_count.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<15} {:<12} {:<16} {:<20} {:<8} {:<7} {}",
                    e.timestamp_ms,
                    e.owner_id,
                    e.entity_type,
                    e.entity_id,
                    e.status.as_str(),
                    retries,
                    e.error_message.as_deref().unwrap_or("")
                );
            }
            println!("({} entries)", entries.len());
        }
    }
    Ok(())
}

fn print_pending(records: &[OperationRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(records)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(io::stdout());
            wtr.write_record([
                "id",
                "owner_id",
                "entity_type",
                "entity_id",
                "operation_kind",
                "direction",
                "priority",
                "retry_count",
                "created_at_ms",
            ])?;
            for r in records {
                wtr.write_record([
                    r.id.to_string(),
                    r.owner_id.clone(),
                    r.entity_type.to_string(),
                    r.entity_id.clone(),
                    r.operation_kind.to_string(),
                    r.direction.to_string(),
                    r.priority.to_string(),
                    r.retry_count.to_string(),
                    r.created_at_ms.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            println!(
                "{:<8} {:<12} {:<16} {:<20} {:<7} {:<20} {:<7} RETRIES",
                "ID", "OWNER", "ENTITY_TYPE", "ENTITY_ID", "KIND", "DIRECTION", "PRIO"
            );
            for r in records {
                println!(
                    "{:<8} {:<12} {:<16} {:<20} {:<7} {:<20} {:<7} {}",
                    r.id,
                    r.owner_id,
                    r.entity_type,
                    r.entity_id,
                    r.operation_kind,
                    r.direction,
                    r.priority,
                    r.retry_count
                );
            }
            println!("({} pending)", records.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage = StorageConfig::Sled { data_dir: dir };
    }

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Log {
            owner,
            entity_type,
            entity_id,
            status,
            since_ms,
            until_ms,
            limit,
            format,
        } => {
            let stores = DurableStores::open(data_dir_of(&config)?)?;
            let filter = SyncLogFilter {
                owner_id: owner,
                entity_type,
                entity_id,
                status,
                since_ms,
                until_ms,
                limit: Some(limit),
            };
            let entries = stores.sync_log.query(&filter).await?;
            info!("Sync log query returned {} entries", entries.len());
            print_entries(&entries, format)?;
        }
        Command::Pending { format } => {
            let stores = DurableStores::open(data_dir_of(&config)?)?;
            let mut records = stores.journal.load()?;
            records.sort_by_key(|r| r.id);
            print_pending(&records, format)?;
        }
    }

    Ok(())
}
