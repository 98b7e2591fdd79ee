//! BarVault CLI: run update cycles and inspect stored datasets.
//!
//! Commands:
//! - `update`: run one update cycle for every configured dataset
//! - `status`: row counts, stored range and health per dataset
//! - `gaps`: holes in the stored series per dataset
//!
//! Logging goes through `tracing`; set `RUST_LOG=barvault_core=debug` for
//! per-state detail.

use anyhow::{bail, Context, Result};
use barvault_core::domain::DatasetKey;
use barvault_core::fetch::ProviderRegistry;
use barvault_core::gaps::GapDetector;
use barvault_core::metadata::{health_of, Outcome};
use barvault_core::update::{UpdateRequest, UpdateStrategy};
use barvault_core::{StoreConfig, SystemClock};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "barvault", about = "BarVault CLI: partitioned OHLCV storage and updates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an update cycle for each configured dataset.
    Update {
        /// Path to the TOML store config.
        #[arg(long)]
        config: PathBuf,

        /// Override every dataset's strategy (incremental, append_only, full_refresh, backfill).
        #[arg(long)]
        strategy: Option<String>,

        /// Only update datasets for this symbol.
        #[arg(long)]
        symbol: Option<String>,

        /// Print results as JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report row counts, stored range and health.
    Status {
        /// Path to the TOML store config.
        #[arg(long)]
        config: PathBuf,
    },
    /// List gaps in each configured dataset.
    Gaps {
        /// Path to the TOML store config.
        #[arg(long)]
        config: PathBuf,

        /// Only inspect datasets for this symbol.
        #[arg(long)]
        symbol: Option<String>,
    },
}

fn main() -> Result<()> {
    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Update {
            config,
            strategy,
            symbol,
            json,
        } => run_update(&config, strategy.as_deref(), symbol.as_deref(), json),
        Commands::Status { config } => run_status(&config),
        Commands::Gaps { config, symbol } => run_gaps(&config, symbol.as_deref()),
    }
}

fn load_config(path: &Path) -> Result<StoreConfig> {
    StoreConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn selected_requests(config: &StoreConfig, symbol: Option<&str>) -> Result<Vec<UpdateRequest>> {
    let requests: Vec<UpdateRequest> = config
        .requests()?
        .into_iter()
        .filter(|r| symbol.map_or(true, |s| r.key.symbol == s))
        .collect();
    if requests.is_empty() {
        match symbol {
            Some(s) => bail!("no configured dataset for symbol '{s}'"),
            None => bail!("config lists no [[datasets]]"),
        }
    }
    Ok(requests)
}

fn run_update(
    config_path: &Path,
    strategy: Option<&str>,
    symbol: Option<&str>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let override_strategy = strategy
        .map(str::parse::<UpdateStrategy>)
        .transpose()?;

    let mut requests = selected_requests(&config, symbol)?;
    if let Some(strategy) = override_strategy {
        for request in &mut requests {
            request.strategy = strategy;
        }
    }

    let manager = config.manager(&ProviderRegistry::with_defaults(), Arc::new(SystemClock))?;
    info!(datasets = requests.len(), base = %config.base_path.display(), "starting update");
    let results = manager.update_many(&requests);

    let failed = results.iter().filter(|r| !r.success).count();
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            println!("{result}");
        }
        println!();
        println!(
            "{} dataset(s): {} ok, {failed} failed",
            results.len(),
            results.len() - failed
        );
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = config.manager(&ProviderRegistry::with_defaults(), Arc::new(SystemClock))?;
    let engine = manager.engine();
    let metadata = manager.metadata();

    // Configured datasets first, then anything else found on disk.
    let mut keys: Vec<DatasetKey> = config.requests()?.into_iter().map(|r| r.key).collect();
    for key in engine.list_keys()? {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    if keys.is_empty() {
        println!("Store is empty: {}", config.base_path.display());
        return Ok(());
    }

    println!("Store: {}", config.base_path.display());
    println!();
    println!(
        "{:<32} {:>10} {:<41} {:<8} {:<20}",
        "Dataset", "Rows", "Range", "Health", "Last update"
    );
    println!("{}", "-".repeat(115));
    for key in &keys {
        let Some(record) = metadata.get(key)? else {
            println!("{:<32} {:>10} {:<41} {:<8} {:<20}", key.to_string(), "-", "(no metadata)", "-", "-");
            continue;
        };
        let range = match record.range() {
            Some(r) => format!("{} to {}", r.start, r.end),
            None => "(empty)".into(),
        };
        let health = health_of(&record, metadata.now(), metadata.stale_after());
        let last = match record.update_history.latest() {
            Some(entry) => match &entry.outcome {
                Outcome::Success => format!("{} ok", entry.strategy),
                Outcome::Failed { kind, .. } => format!("{} {kind}", entry.strategy),
            },
            None => "-".into(),
        };
        println!(
            "{:<32} {:>10} {:<41} {:<8} {:<20}",
            key.to_string(),
            record.row_count,
            range,
            health.to_string(),
            last
        );
    }
    Ok(())
}

fn run_gaps(config_path: &Path, symbol: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    let engine = config.engine()?;

    let mut total = 0;
    for request in selected_requests(&config, symbol)? {
        let detector = GapDetector::new(config.gap_tolerance, request.calendar.clone());
        let timestamps: Vec<_> = engine
            .read_all(&request.key)?
            .into_iter()
            .map(|b| b.timestamp)
            .collect();
        let gaps = detector.detect(&timestamps, request.key.frequency.step());
        total += gaps.len();

        if gaps.is_empty() {
            println!("{}: no gaps ({} rows)", request.key, timestamps.len());
            continue;
        }
        let missing: usize = gaps.iter().map(|g| g.missing_count).sum();
        println!(
            "{}: {} gap(s), {missing} missing bar(s)",
            request.key,
            gaps.len()
        );
        for gap in &gaps {
            println!("  {gap}");
        }
    }

    if total > 0 {
        println!();
        println!("Run `barvault update --strategy backfill` to fill them.");
    }
    Ok(())
}
