use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use harvest_adapters::HtmlNavigator;
use harvest_core::{HarvestKind, HarvestMode};
use harvest_storage::{load_mapping_csv, write_mapping_csv};
use harvest_sync::{
    build_matcher, derive_mapping, install_signal_handler, load_mapping, open_store, reset_markers,
    status_report, HarvestConfig, HarvestEngine, ShutdownFlag,
};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "harvest")]
#[command(about = "Resumable catalog pricing and SIN harvester")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Flags that override the `HARVEST_*` environment settings.
#[derive(Debug, Args)]
struct Overrides {
    /// Catalog store (CSV)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Manufacturer root mapping (CSV with original,root)
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,
    /// YAML file with match thresholds and unit aliases
    #[arg(long, global = true)]
    rules: Option<PathBuf>,
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    backup_retention: Option<usize>,
    /// Minimum delay between page fetches, in milliseconds
    #[arg(long, global = true)]
    rate_limit_ms: Option<u64>,
    #[arg(long, global = true)]
    save_every: Option<usize>,
    #[arg(long, global = true)]
    max_attempts: Option<usize>,
}

impl Overrides {
    fn apply(self, mut config: HarvestConfig) -> HarvestConfig {
        if let Some(store) = self.store {
            config.store = store;
        }
        if let Some(mapping) = self.mapping {
            config.mapping = mapping;
        }
        if self.rules.is_some() {
            config.match_rules = self.rules;
        }
        if self.backup_dir.is_some() {
            config.backup_dir = self.backup_dir;
        }
        if let Some(retention) = self.backup_retention {
            config.backup_retention = retention;
        }
        if let Some(ms) = self.rate_limit_ms {
            config.rate_limit = Duration::from_millis(ms);
        }
        if let Some(every) = self.save_every {
            config.save_every = every;
            config.sin_save_every = every;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_attempts = attempts;
        }
        config
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Pricing,
    Sin,
}

impl From<KindArg> for HarvestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pricing => HarvestKind::Pricing,
            KindArg::Sin => HarvestKind::Sin,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest the first N eligible records
    Test {
        #[arg(default_value_t = 5)]
        count: usize,
    },
    /// Harvest rows START..=END (1-based)
    Range { start: usize, end: usize },
    /// Harvest every record
    Full,
    /// Harvest the record with this item or stock number
    Single { item: String },
    /// Harvest records with no pricing values yet
    Missing {
        #[arg(long)]
        from: Option<usize>,
    },
    /// Harvest SINs for records that have none
    Sin {
        #[arg(long)]
        start: Option<usize>,
        #[arg(long)]
        end: Option<usize>,
    },
    /// Derive manufacturer roots from the store into the mapping file
    Roots,
    /// Print completion counts for the store
    Status {
        #[arg(long, value_enum, default_value = "pricing")]
        kind: KindArg,
    },
    /// Clear not-found markers so those records are attempted again
    ResetMarkers {
        #[arg(long, value_enum, default_value = "pricing")]
        kind: KindArg,
        #[arg(long)]
        from: Option<usize>,
    },
}

impl Commands {
    fn harvest_mode(&self) -> Option<HarvestMode> {
        let mode = match self {
            Commands::Test { count } => HarvestMode::Test { count: *count },
            Commands::Range { start, end } => HarvestMode::Range {
                start: *start,
                end: *end,
            },
            Commands::Full => HarvestMode::Full,
            Commands::Single { item } => HarvestMode::Single { item: item.clone() },
            Commands::Missing { from } => HarvestMode::MissingOnly { from: *from },
            Commands::Sin { start, end } => HarvestMode::Sin {
                start: *start,
                end: *end,
            },
            Commands::Roots | Commands::Status { .. } | Commands::ResetMarkers { .. } => {
                return None
            }
        };
        Some(mode)
    }
}

/// Command that picks an interrupted run back up at `row`.
fn resume_command(mode: &HarvestMode, row: usize, last_row: usize) -> String {
    match mode {
        HarvestMode::Range { end, .. } => format!("harvest range {row} {end}"),
        HarvestMode::Full | HarvestMode::Test { .. } => format!("harvest range {row} {last_row}"),
        HarvestMode::Single { item } => format!("harvest single {item}"),
        HarvestMode::MissingOnly { .. } => format!("harvest missing --from {row}"),
        HarvestMode::Sin { end, .. } => match end {
            Some(end) => format!("harvest sin --start {row} --end {end}"),
            None => format!("harvest sin --start {row}"),
        },
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn harvest(config: HarvestConfig, mode: HarvestMode) -> Result<()> {
    if let HarvestMode::Range { start, end } = mode {
        anyhow::ensure!(start >= 1 && start <= end, "invalid row range {start}..={end}");
    }
    let (checkpointer, mut store) = open_store(&config).await?;
    let mapping = load_mapping(&config, &store).await?;
    let matcher = build_matcher(&config, mapping)?;

    let run_id = Uuid::new_v4();
    let navigator =
        HtmlNavigator::new(config.http_config(), run_id).context("starting navigator")?;
    let shutdown = ShutdownFlag::new();
    let listener = install_signal_handler(shutdown.clone());

    let mut engine =
        HarvestEngine::new(config, navigator, matcher, checkpointer, shutdown).with_run_id(run_id);
    let result = engine.run(&mut store, &mode).await;
    listener.abort();
    let summary = result?;

    println!(
        "harvest {}: run_id={} processed={} skipped={} filled={} slots={} not_found={} \
         unchanged={} failed={} saves={}",
        summary.mode,
        summary.run_id,
        summary.processed,
        summary.skipped,
        summary.filled,
        summary.slots_written,
        summary.not_found,
        summary.unchanged,
        summary.failed,
        summary.saves
    );
    for failure in &summary.failures {
        println!(
            "  row {} ({}): {} failed: {}",
            failure.row, failure.item, failure.phase, failure.error
        );
    }
    if summary.interrupted {
        match summary.resume_row {
            Some(row) => {
                let last_row = store
                    .records()
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(position, record)| mode.selects(*position, record))
                    .map_or(row, |(_, record)| record.row);
                println!("interrupted; resume with: {}", resume_command(&mode, row, last_row));
            }
            None => println!("interrupted after the last eligible record"),
        }
    }
    Ok(())
}

async fn derive_roots(config: HarvestConfig) -> Result<()> {
    let (_, store) = open_store(&config).await?;
    let existing = load_mapping_csv(&config.mapping)
        .await
        .with_context(|| format!("loading mapping {}", config.mapping.display()))?;
    let before = existing.len();
    let (mapping, unresolved) = derive_mapping(&store, existing);
    for name in &unresolved {
        warn!(manufacturer = %name, "no usable root form");
    }
    write_mapping_csv(&config.mapping, &mapping)
        .await
        .with_context(|| format!("writing mapping {}", config.mapping.display()))?;
    println!(
        "roots: {} mapped ({} new, {} unresolved) -> {}",
        mapping.len(),
        mapping.len() - before,
        unresolved.len(),
        config.mapping.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.overrides.apply(HarvestConfig::from_env());

    if let Some(mode) = cli.command.harvest_mode() {
        return harvest(config, mode).await;
    }
    match cli.command {
        Commands::Roots => derive_roots(config).await?,
        Commands::Status { kind } => {
            let (_, store) = open_store(&config).await?;
            println!("{}", status_report(&store, kind.into()));
        }
        Commands::ResetMarkers { kind, from } => {
            let (mut checkpointer, mut store) = open_store(&config).await?;
            let cleared = reset_markers(&mut store, kind.into(), from);
            if cleared > 0 {
                let report = checkpointer.save(&store).await.context("saving store")?;
                info!(path = %report.path.display(), sha256 = %report.sha256, "store saved");
            }
            println!("reset-markers: cleared {cleared} records");
        }
        _ => {}
    }

    Ok(())
}
