//! Offline store operations: status counts, marker reset and root derivation.

use std::fmt;

use harvest_core::{HarvestKind, ManufacturerMapping, RecordStatus};
use harvest_storage::RecordStore;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub kind: HarvestKind,
    pub total: usize,
    pub complete: usize,
    pub partial: usize,
    pub not_found: usize,
    pub untouched: usize,
    pub excluded: usize,
    pub first_untouched_row: Option<usize>,
}

pub fn status_report(store: &RecordStore, kind: HarvestKind) -> StatusReport {
    let mut report = StatusReport {
        kind,
        total: store.records().len(),
        complete: 0,
        partial: 0,
        not_found: 0,
        untouched: 0,
        excluded: store.excluded().len(),
        first_untouched_row: None,
    };
    for record in store.records() {
        match record.status(kind) {
            RecordStatus::Complete => report.complete += 1,
            RecordStatus::Partial => report.partial += 1,
            RecordStatus::NotFound => report.not_found += 1,
            RecordStatus::Untouched => {
                report.untouched += 1;
                report.first_untouched_row.get_or_insert(record.row);
            }
        }
    }
    report
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} status over {} records", self.kind.as_str(), self.total)?;
        writeln!(f, "  complete:   {}", self.complete)?;
        writeln!(f, "  partial:    {}", self.partial)?;
        writeln!(f, "  not found:  {}", self.not_found)?;
        writeln!(f, "  untouched:  {}", self.untouched)?;
        writeln!(f, "  excluded:   {}", self.excluded)?;
        match self.first_untouched_row {
            Some(row) => write!(f, "  first untouched row: {row}"),
            None => write!(f, "  no untouched rows"),
        }
    }
}

/// Clears not-found markers so those records are attempted again. Returns
/// how many records changed.
pub fn reset_markers(store: &mut RecordStore, kind: HarvestKind, from_row: Option<usize>) -> usize {
    store
        .records_mut()
        .iter_mut()
        .filter(|r| from_row.map_or(true, |from| r.row >= from))
        .map(|r| r.clear_not_found(kind))
        .filter(|cleared| *cleared)
        .count()
}

/// Extends `existing` with derived roots for every manufacturer in the
/// store. Returns the mapping and the names that yielded no root.
pub fn derive_mapping(
    store: &RecordStore,
    mut existing: ManufacturerMapping,
) -> (ManufacturerMapping, Vec<String>) {
    let unresolved = existing.ensure_covers(store.manufacturers());
    (existing, unresolved)
}
