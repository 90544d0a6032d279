//! Per-record harvest state machine: skip, fetch, extract and fill, or fail,
//! with periodic checkpoints and cooperative shutdown.

use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::{NavigationError, Navigator};
use harvest_core::{Candidate, HarvestKind, HarvestMode, Record, SlotFill, SLOT_COUNT};
use harvest_storage::{write_json_atomic, Checkpointer, FetchPacer, RecordStore};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HarvestConfig;
use crate::matcher::{CandidateMatcher, MatchOutcome};
use crate::normalize::NormalizationCache;
use crate::progress::{ProgressTracker, ETA_WINDOW};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Restart,
    Navigate,
    Collect,
    LoadMore,
    Detail,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Restart => "restart",
            Phase::Navigate => "navigate",
            Phase::Collect => "collect",
            Phase::LoadMore => "load_more",
            Phase::Detail => "detail",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct PhaseError {
    phase: Phase,
    source: NavigationError,
}

fn at(phase: Phase) -> impl FnOnce(NavigationError) -> PhaseError {
    move |source| PhaseError { phase, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Completion rule already satisfied; no I/O happened.
    Skipped,
    /// New values written into these 1-based slots.
    Filled { slots: Vec<usize> },
    /// The page was reached but nothing matched.
    NotFound,
    /// Candidates matched but produced no complete fill.
    Unchanged,
    Failed { phase: Phase, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub row: usize,
    pub item: String,
    pub phase: Phase,
    pub error: String,
}

/// Outcome of one run, also written to `<store>.last_run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub kind: HarvestKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub eligible: usize,
    pub processed: usize,
    pub skipped: usize,
    pub filled: usize,
    pub slots_written: usize,
    pub not_found: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failures: Vec<FailedRecord>,
    pub saves: usize,
    pub interrupted: bool,
    pub last_completed_row: Option<usize>,
    pub resume_row: Option<usize>,
}

impl RunSummary {
    fn new(run_id: Uuid, mode: &HarvestMode, eligible: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode: mode.label().to_string(),
            kind: mode.kind(),
            started_at: now,
            finished_at: now,
            eligible,
            processed: 0,
            skipped: 0,
            filled: 0,
            slots_written: 0,
            not_found: 0,
            unchanged: 0,
            failed: 0,
            failures: Vec::new(),
            saves: 0,
            interrupted: false,
            last_completed_row: None,
            resume_row: None,
        }
    }

    fn absorb(&mut self, row: usize, item: &str, outcome: &RecordOutcome) {
        self.processed += 1;
        self.last_completed_row = Some(row);
        match outcome {
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Filled { slots } => {
                self.filled += 1;
                self.slots_written += slots.len();
            }
            RecordOutcome::NotFound => self.not_found += 1,
            RecordOutcome::Unchanged => self.unchanged += 1,
            RecordOutcome::Failed { phase, error } => {
                self.failed += 1;
                self.failures.push(FailedRecord {
                    row,
                    item: item.to_string(),
                    phase: *phase,
                    error: error.clone(),
                });
            }
        }
    }
}

fn apply_fills(record: &mut Record, kind: HarvestKind, fills: &[SlotFill]) -> RecordOutcome {
    let slots = record.fill_open_slots(kind, fills);
    if slots.is_empty() {
        debug!(accepted = fills.len(), "accepted candidates gave no complete fill");
        RecordOutcome::Unchanged
    } else {
        info!(?slots, "slots filled");
        RecordOutcome::Filled { slots }
    }
}

fn mark_empty(record: &mut Record, kind: HarvestKind) -> RecordOutcome {
    if record.mark_not_found(kind) {
        RecordOutcome::NotFound
    } else {
        debug!("no open slot for a not-found marker");
        RecordOutcome::Unchanged
    }
}

fn push_unique_sin(record: &Record, found: &mut Vec<String>, sin: String) {
    if !record.has_sin(&sin) && !found.contains(&sin) {
        found.push(sin);
    }
}

/// Drives one navigator over the records selected by a [`HarvestMode`].
pub struct HarvestEngine<N: Navigator> {
    config: HarvestConfig,
    navigator: N,
    matcher: CandidateMatcher,
    cache: NormalizationCache,
    pacer: FetchPacer,
    checkpointer: Checkpointer,
    shutdown: ShutdownFlag,
    run_id: Uuid,
}

impl<N: Navigator> HarvestEngine<N> {
    pub fn new(
        config: HarvestConfig,
        navigator: N,
        matcher: CandidateMatcher,
        checkpointer: Checkpointer,
        shutdown: ShutdownFlag,
    ) -> Self {
        let pacer = FetchPacer::new(config.rate_limit);
        Self {
            config,
            navigator,
            matcher,
            cache: NormalizationCache::default(),
            pacer,
            checkpointer,
            shutdown,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn into_navigator(self) -> N {
        self.navigator
    }

    pub async fn run(&mut self, store: &mut RecordStore, mode: &HarvestMode) -> Result<RunSummary> {
        let kind = mode.kind();
        let eligible: Vec<usize> = store
            .records()
            .iter()
            .enumerate()
            .filter(|(position, record)| mode.selects(*position, record))
            .map(|(idx, _)| idx)
            .collect();
        info!(
            run_id = %self.run_id,
            mode = mode.label(),
            eligible = eligible.len(),
            excluded = store.excluded().len(),
            "harvest starting"
        );

        let mut summary = RunSummary::new(self.run_id, mode, eligible.len());
        let mut progress = ProgressTracker::new(eligible.len(), ETA_WINDOW);
        let save_every = self.config.save_every_for(kind);
        let mut unsaved = 0usize;
        let mut since_recycle = 0usize;

        for (n, &idx) in eligible.iter().enumerate() {
            if self.shutdown.is_requested() {
                summary.interrupted = true;
                summary.resume_row = Some(store.records()[idx].row);
                break;
            }

            let started = Instant::now();
            let record = &mut store.records_mut()[idx];
            let (row, item) = (record.row, record.item_number.clone());
            let outcome = if mode.is_complete(record) {
                debug!(row, %item, "already complete, skipping");
                RecordOutcome::Skipped
            } else {
                let span = info_span!("record", row, %item, kind = kind.as_str());
                self.process_with_retries(record, kind).instrument(span).await
            };

            summary.absorb(row, &item, &outcome);
            progress.record(started.elapsed());
            if outcome != RecordOutcome::Skipped {
                unsaved += 1;
                since_recycle += 1;
                info!(row, %item, ?outcome, progress = %progress, "record done");
            }

            if unsaved >= save_every {
                self.save_or_close(store, &mut summary).await?;
                unsaved = 0;
            }
            if self.config.recycle_every > 0
                && since_recycle >= self.config.recycle_every
                && n + 1 < eligible.len()
            {
                info!(after = since_recycle, "recycling navigator");
                if let Err(err) = self.navigator.restart().await {
                    warn!(%err, "navigator recycle failed");
                }
                since_recycle = 0;
            }
        }
        if self.shutdown.is_requested() {
            summary.interrupted = true;
        }

        if unsaved > 0 {
            self.save_or_close(store, &mut summary).await?;
        }
        if let Err(err) = self.navigator.close().await {
            warn!(%err, "navigator close failed");
        }
        summary.finished_at = Utc::now();

        if summary.interrupted {
            warn!(
                last_completed_row = ?summary.last_completed_row,
                resume_row = ?summary.resume_row,
                "harvest interrupted; progress saved"
            );
        } else {
            info!(
                processed = summary.processed,
                filled = summary.filled,
                not_found = summary.not_found,
                failed = summary.failed,
                cache_hits = self.cache.hits(),
                cache_misses = self.cache.misses(),
                "harvest finished"
            );
        }

        let path = self.config.summary_path();
        if let Err(err) = write_json_atomic(&path, &summary).await {
            warn!(path = %path.display(), %err, "could not write run summary");
        }
        Ok(summary)
    }

    async fn save(&mut self, store: &RecordStore, summary: &mut RunSummary) -> Result<()> {
        self.checkpointer
            .save(store)
            .await
            .with_context(|| format!("saving {}", self.checkpointer.target().display()))?;
        summary.saves += 1;
        Ok(())
    }

    /// Saves, closing the navigator before handing back a failed save.
    async fn save_or_close(&mut self, store: &RecordStore, summary: &mut RunSummary) -> Result<()> {
        let saved = self.save(store, summary).await;
        if let Err(err) = &saved {
            error!(err = ?err, "checkpoint failed, stopping");
            if let Err(err) = self.navigator.close().await {
                warn!(%err, "navigator close failed");
            }
        }
        saved
    }

    /// Runs one record, restarting the navigator and retrying transient
    /// failures up to `max_attempts`.
    async fn process_with_retries(
        &mut self,
        record: &mut Record,
        kind: HarvestKind,
    ) -> RecordOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if !self.navigator.is_healthy().await {
                warn!(attempt, "navigator unhealthy, restarting");
                if let Err(err) = self.navigator.restart().await {
                    error!(phase = %Phase::Restart, %err, "record failed");
                    return RecordOutcome::Failed {
                        phase: Phase::Restart,
                        error: err.to_string(),
                    };
                }
            }

            let result = match kind {
                HarvestKind::Pricing => self.harvest_pricing(record).await,
                HarvestKind::Sin => self.harvest_sin(record).await,
            };
            match result {
                Ok(outcome) => return outcome,
                Err(failure) if failure.source.is_transient() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        phase = %failure.phase,
                        err = %failure.source,
                        "transient failure, retrying"
                    );
                    if let Err(err) = self.navigator.restart().await {
                        warn!(%err, "navigator restart failed");
                    }
                    attempt += 1;
                }
                Err(failure) => {
                    error!(attempt, phase = %failure.phase, err = %failure.source, "record failed");
                    return RecordOutcome::Failed {
                        phase: failure.phase,
                        error: failure.source.to_string(),
                    };
                }
            }
        }
    }

    /// Navigates to a results page and matches its products, loading more
    /// until satisfied, out of scrolls, or the page stops growing.
    async fn search(
        &mut self,
        record: &Record,
        kind: HarvestKind,
        url: &str,
        required: usize,
    ) -> Result<MatchOutcome, PhaseError> {
        self.pacer.wait().await;
        self.navigator.navigate(url).await.map_err(at(Phase::Navigate))?;

        let mut scrolls = 0;
        loop {
            let elements = self
                .navigator
                .candidate_elements()
                .await
                .map_err(at(Phase::Collect))?;
            let extractor = self.matcher.extractor();
            let candidates: Vec<Candidate> = elements
                .into_iter()
                .enumerate()
                .map(|(position, e)| {
                    extractor.candidate_from_text(position, &e.text, e.detail_ref)
                })
                .collect();
            let outcome = self.matcher.match_candidates(
                record,
                kind,
                required,
                &candidates,
                &mut self.cache,
            );
            if outcome.early_satisfied || scrolls >= self.config.max_scrolls {
                return Ok(outcome);
            }
            let grew = self.navigator.load_more().await.map_err(at(Phase::LoadMore))?;
            scrolls += 1;
            if !grew {
                return Ok(outcome);
            }
            debug!(scrolls, candidates = candidates.len(), "page grew");
        }
    }

    async fn harvest_pricing(&mut self, record: &mut Record) -> Result<RecordOutcome, PhaseError> {
        let kind = HarvestKind::Pricing;
        let Some(url) = record.search_ref.clone() else {
            return Ok(RecordOutcome::Failed {
                phase: Phase::Navigate,
                error: "record has no search reference".to_string(),
            });
        };
        let required = record.open_slots(kind).min(SLOT_COUNT);
        let outcome = self.search(record, kind, &url, required).await?;
        if outcome.accepted.is_empty() {
            info!(rejected = outcome.rejected, "no matching candidates");
            return Ok(mark_empty(record, kind));
        }

        let extractor = self.matcher.extractor();
        let fills: Vec<SlotFill> = outcome
            .accepted
            .iter()
            .map(|c| extractor.extract(&c.raw_text).to_fill())
            .collect();
        Ok(apply_fills(record, kind, &fills))
    }

    async fn sin_from_detail(&mut self, url: &str) -> Result<Option<String>, PhaseError> {
        self.pacer.wait().await;
        self.navigator.navigate(url).await.map_err(at(Phase::Detail))?;
        let text = self.navigator.rendered_text().await.map_err(at(Phase::Detail))?;
        Ok(self.matcher.extractor().sin(&text))
    }

    /// Direct detail links when the record has them; otherwise search, match
    /// and follow the accepted products' detail links.
    async fn harvest_sin(&mut self, record: &mut Record) -> Result<RecordOutcome, PhaseError> {
        let kind = HarvestKind::Sin;
        let target = self.config.sin_target.max(1).min(record.open_slots(kind));
        if target == 0 {
            return Ok(RecordOutcome::Unchanged);
        }
        let mut found = Vec::new();

        let direct: Vec<String> = record.detail_refs().map(str::to_string).collect();
        if !direct.is_empty() {
            for url in &direct {
                if found.len() >= target {
                    break;
                }
                if let Some(sin) = self.sin_from_detail(url).await? {
                    push_unique_sin(record, &mut found, sin);
                }
            }
        } else if let Some(url) = record.search_ref.clone() {
            let outcome = self.search(record, kind, &url, target).await?;
            for candidate in &outcome.accepted {
                if found.len() >= target {
                    break;
                }
                let sin = match &candidate.detail_ref {
                    Some(detail) => self.sin_from_detail(detail).await?,
                    None => self.matcher.extractor().sin(&candidate.raw_text),
                };
                if let Some(sin) = sin {
                    push_unique_sin(record, &mut found, sin);
                }
            }
        } else {
            return Ok(RecordOutcome::Failed {
                phase: Phase::Navigate,
                error: "record has no search reference or detail link".to_string(),
            });
        }

        if found.is_empty() {
            info!("no SIN found");
            return Ok(mark_empty(record, kind));
        }
        let fills: Vec<SlotFill> = found
            .into_iter()
            .map(|sin| SlotFill {
                sin: Some(sin),
                ..SlotFill::default()
            })
            .collect();
        Ok(apply_fills(record, kind, &fills))
    }
}
