use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use spanindex_core::config::IndexConfig;
use spanindex_core::record::{IndexRecord, WriteBatch};
use spanindex_core::storage::IndexStore;
use spanindex_storage::FjallBucketStore;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "spanindex",
    about = "Time-bucketed trace id index for span payload locations",
    version
)]
struct Cli {
    /// JSON config file (`base_path`, `store_file_name`, `flush_threshold`, `sync_on_flush`).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root directory for bucket stores. Overrides `base_path` from the config file.
    #[arg(short, long)]
    base_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index records read as JSON Lines (one IndexRecord per line).
    Write {
        /// Bucket timestamp, already truncated to the bucket granularity.
        #[arg(short, long)]
        timestamp: u64,

        /// Input file. Reads stdin when omitted.
        #[arg(short, long, value_name = "PATH")]
        input: Option<PathBuf>,
    },
    /// Print every record indexed under a trace id as JSON Lines.
    Lookup {
        #[arg(short, long)]
        timestamp: u64,

        trace_id: String,
    },
    /// Print the number of records in a bucket.
    Size {
        #[arg(short, long)]
        timestamp: u64,
    },
}

fn default_base_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spanindex")
        .join("index")
}

fn resolve_config(cli: &Cli) -> anyhow::Result<IndexConfig> {
    let mut config = match &cli.config {
        Some(path) => IndexConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IndexConfig::new(default_base_path()),
    };
    if let Some(base_path) = &cli.base_path {
        config.base_path = base_path.clone();
    }
    config.validate()?;
    Ok(config)
}

fn read_batch(reader: impl BufRead) -> anyhow::Result<WriteBatch> {
    let mut batch = WriteBatch::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IndexRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid record on line {}", line_no + 1))?;
        batch.push(record);
    }
    Ok(batch)
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spanindex=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Write { timestamp, input } => {
            let batch = match input {
                Some(path) => {
                    let file = std::fs::File::open(&path)
                        .with_context(|| format!("opening {}", path.display()))?;
                    read_batch(BufReader::new(file))?
                }
                None => read_batch(std::io::stdin().lock())?,
            };
            with_store(&config, timestamp, |store| {
                store.write(&batch)?;
                println!("{}", store.size()?);
                Ok(())
            })
        }
        Command::Lookup {
            timestamp,
            trace_id,
        } => with_store(&config, timestamp, |store| {
            for record in store.lookup_by_trace_id(&trace_id) {
                println!("{}", serde_json::to_string(&record)?);
            }
            if store.stats().lookup_failures > 0 {
                tracing::warn!(
                    %trace_id,
                    "lookup could not read the store; output may be incomplete"
                );
            }
            Ok(())
        }),
        Command::Size { timestamp } => with_store(&config, timestamp, |store| {
            println!("{}", store.size()?);
            Ok(())
        }),
    }
}

/// Opens the bucket store, runs `f`, and closes the store even when `f` fails.
fn with_store(
    config: &IndexConfig,
    timestamp: u64,
    f: impl FnOnce(&mut FjallBucketStore) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut store = FjallBucketStore::open(config, timestamp)?;
    let result = f(&mut store);
    store.close();
    result
}
