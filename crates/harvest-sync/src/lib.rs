//! Harvest engine: normalization, similarity, candidate matching, the
//! per-record orchestrator, and the run-level plumbing around it.

pub mod config;
pub mod maintenance;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod progress;
pub mod shutdown;
pub mod similarity;

use anyhow::{Context, Result};
use harvest_adapters::FieldExtractor;
use harvest_core::ManufacturerMapping;
use harvest_storage::{load_mapping_csv, Checkpointer, RecordStore};
use tracing::{info, warn};

pub use config::HarvestConfig;
pub use maintenance::{derive_mapping, reset_markers, status_report, StatusReport};
pub use matcher::{CandidateMatcher, ManufacturerTier, MatchOutcome};
pub use normalize::{normalize, NormalizationCache, NormalizeKind};
pub use orchestrator::{FailedRecord, HarvestEngine, Phase, RecordOutcome, RunSummary};
pub use progress::ProgressTracker;
pub use shutdown::{install_signal_handler, ShutdownFlag, FORCED_EXIT_CODE};
pub use similarity::{MatchConfig, SimilarityEngine};

pub const CRATE_NAME: &str = "harvest-sync";

/// Opens the checkpoint layer (sweeping stale temp files) and loads the
/// store, recovering from the newest backup if the file is gone.
pub async fn open_store(config: &HarvestConfig) -> Result<(Checkpointer, RecordStore)> {
    let checkpointer = Checkpointer::open(config.checkpoint_config())
        .await
        .context("opening checkpoint directory")?;
    let store = checkpointer
        .load_or_recover()
        .await
        .with_context(|| format!("loading store {}", config.store.display()))?;
    info!(
        path = %config.store.display(),
        records = store.records().len(),
        excluded = store.excluded().len(),
        shape = %store.shape(),
        "store loaded"
    );
    Ok((checkpointer, store))
}

/// Loads the mapping file and derives roots for any store manufacturer it
/// does not cover.
pub async fn load_mapping(
    config: &HarvestConfig,
    store: &RecordStore,
) -> Result<ManufacturerMapping> {
    let mut mapping = load_mapping_csv(&config.mapping)
        .await
        .with_context(|| format!("loading mapping {}", config.mapping.display()))?;
    let before = mapping.len();
    for name in mapping.ensure_covers(store.manufacturers()) {
        warn!(manufacturer = %name, "no usable root form");
    }
    if mapping.len() > before {
        info!(derived = mapping.len() - before, "derived roots for unmapped manufacturers");
    }
    Ok(mapping)
}

pub fn build_matcher(
    config: &HarvestConfig,
    mapping: ManufacturerMapping,
) -> Result<CandidateMatcher> {
    let rules = match &config.match_rules {
        Some(path) => MatchConfig::load(path)?,
        None => MatchConfig::default(),
    };
    Ok(CandidateMatcher::new(
        mapping,
        SimilarityEngine::new(rules),
        FieldExtractor::new()?,
    ))
}
