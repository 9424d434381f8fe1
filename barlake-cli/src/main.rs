//! barlake CLI: run ingestion and inspect its durable state.
//!
//! Commands:
//! - `ingest` runs every symbol in a TOML config through the coordinator
//! - `status` reports per-day completeness (and partition row counts) for a symbol
//! - `checkpoint show` / `checkpoint clear` inspect or reset a symbol's cursor

use anyhow::{Context, Result};
use barlake_core::data::{PartitionCompression, PartitionWriter};
use barlake_core::domain::Symbol;
use barlake_core::metrics::{CounterMetrics, MetricsSink};
use barlake_core::state::{CheckpointStore, CompletenessStore, FileCheckpointStore, FileCompletenessStore};
use barlake_runner::{IngestConfig, IngestionCoordinator};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "barlake", about = "barlake: resilient OHLCV ingestion into Parquet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every configured symbol over the configured date range.
    Ingest {
        /// Path to the TOML ingestion config.
        #[arg(long)]
        config: PathBuf,

        /// Only ingest these symbols (must appear in the config).
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Per-day completeness for a symbol.
    Status {
        /// State directory (the config's `state_path`, default `{output_path}/_state`).
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long)]
        symbol: String,

        /// Output directory; when given, partition row counts are listed too.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Checkpoint inspection and reset.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint as JSON.
    Show {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long)]
        symbol: String,
    },
    /// Delete the checkpoint so the next job starts from the beginning.
    Clear {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long)]
        symbol: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { config, symbols } => run_ingest(&config, &symbols),
        Commands::Status {
            state_dir,
            symbol,
            output_dir,
        } => run_status(&state_dir, &symbol, output_dir.as_deref()),
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show { state_dir, symbol } => run_checkpoint_show(&state_dir, &symbol),
            CheckpointAction::Clear { state_dir, symbol } => run_checkpoint_clear(&state_dir, &symbol),
        },
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "barlake=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_ingest(config_path: &Path, only: &[String]) -> Result<()> {
    let config = IngestConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let mut symbols = config.symbols()?;
    if !only.is_empty() {
        let wanted = only.iter().map(Symbol::new).collect::<Result<Vec<_>, _>>()?;
        for s in &wanted {
            if !symbols.contains(s) {
                anyhow::bail!("symbol {s} is not in {}", config_path.display());
            }
        }
        symbols.retain(|s| wanted.contains(s));
    }
    let range = config.date_range()?;

    let metrics = Arc::new(CounterMetrics::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let coordinator = IngestionCoordinator::from_config(&config, sink)?;

    for (symbol, result) in coordinator.submit_all(&symbols, range) {
        if let Err(e) = result {
            warn!(%symbol, error = %e, "not submitted");
        }
    }
    info!(symbols = symbols.len(), %range, "submitted");

    let summary = coordinator.run()?;
    print!("{summary}");
    println!();
    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);

    if summary.has_failures() {
        for failure in &summary.failures {
            eprintln!("{} {}: {}", failure.id, failure.symbol, failure.reason);
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(state_dir: &Path, symbol: &str, output_dir: Option<&Path>) -> Result<()> {
    let symbol = Symbol::new(symbol)?;
    let store = FileCompletenessStore::in_state_dir(state_dir);
    let records = store.list(&symbol)?;
    if records.is_empty() {
        println!("No completeness records for {symbol} in {}", state_dir.display());
        return Ok(());
    }

    // Compression only matters for writes; reads detect the codec.
    let partitions = output_dir.map(|dir| PartitionWriter::new(dir, PartitionCompression::default()));

    println!("{:<12} {:>8} {:>8} {:<10} {:>10}", "Date", "Version", "Bars", "State", "Rows");
    println!("{}", "-".repeat(52));
    for r in &records {
        let state = match (r.collection_started, r.is_complete) {
            (_, true) => "complete",
            (true, false) => "partial",
            (false, false) => "pending",
        };
        let rows = match &partitions {
            Some(p) => p.row_count(&symbol, r.trading_date)?.to_string(),
            None => "-".to_string(),
        };
        println!(
            "{:<12} {:>8} {:>8} {:<10} {:>10}",
            r.trading_date.to_string(),
            r.version,
            r.bar_count,
            state,
            rows
        );
    }
    let complete = records.iter().filter(|r| r.is_complete).count();
    println!();
    println!("{complete}/{} day(s) complete", records.len());
    Ok(())
}

fn run_checkpoint_show(state_dir: &Path, symbol: &str) -> Result<()> {
    let symbol = Symbol::new(symbol)?;
    match FileCheckpointStore::in_state_dir(state_dir).load(&symbol)? {
        Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
        None => println!("No checkpoint for {symbol}"),
    }
    Ok(())
}

fn run_checkpoint_clear(state_dir: &Path, symbol: &str) -> Result<()> {
    let symbol = Symbol::new(symbol)?;
    if FileCheckpointStore::in_state_dir(state_dir).clear(&symbol)? {
        println!("Cleared checkpoint for {symbol}");
    } else {
        println!("No checkpoint for {symbol}");
    }
    Ok(())
}
