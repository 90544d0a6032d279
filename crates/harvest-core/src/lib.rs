//! Core domain model for the catalog harvester: records, match slots, harvest modes
//! and the manufacturer root mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "harvest-core";

/// Number of match slots carried by every record.
pub const SLOT_COUNT: usize = 3;

pub const PRICING_NOT_FOUND: &str = "NOT FOUND";
pub const SIN_NOT_FOUND: &str = "SIN not found";

/// Which group of slot sub-fields a run harvests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HarvestKind {
    Pricing,
    Sin,
}

impl HarvestKind {
    pub fn not_found_marker(self) -> &'static str {
        match self {
            HarvestKind::Pricing => PRICING_NOT_FOUND,
            HarvestKind::Sin => SIN_NOT_FOUND,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HarvestKind::Pricing => "pricing",
            HarvestKind::Sin => "sin",
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn is_marker(value: &Option<String>, marker: &str) -> bool {
    value
        .as_deref()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(marker))
}

/// One harvested offer attached to a record. Sub-fields are write-once: a
/// non-empty value is never replaced by a later fill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSlot {
    pub price: Option<String>,
    pub contractor: Option<String>,
    pub contract_number: Option<String>,
    pub sin: Option<String>,
}

/// Values proposed for one slot by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotFill {
    pub price: Option<String>,
    pub contractor: Option<String>,
    pub contract_number: Option<String>,
    pub sin: Option<String>,
}

impl SlotFill {
    /// True when every sub-field the kind requires is present.
    pub fn is_complete_for(&self, kind: HarvestKind) -> bool {
        match kind {
            HarvestKind::Pricing => {
                present(&self.price) && present(&self.contractor) && present(&self.contract_number)
            }
            HarvestKind::Sin => present(&self.sin),
        }
    }

    pub fn not_found(kind: HarvestKind) -> Self {
        let marker = Some(kind.not_found_marker().to_string());
        match kind {
            HarvestKind::Pricing => Self {
                contractor: marker,
                ..Self::default()
            },
            HarvestKind::Sin => Self {
                sin: marker,
                ..Self::default()
            },
        }
    }
}

impl MatchSlot {
    /// A slot is open when none of the kind's sub-fields hold anything.
    pub fn is_open(&self, kind: HarvestKind) -> bool {
        match kind {
            HarvestKind::Pricing => {
                !present(&self.price)
                    && !present(&self.contractor)
                    && !present(&self.contract_number)
            }
            HarvestKind::Sin => !present(&self.sin),
        }
    }

    pub fn is_filled(&self, kind: HarvestKind) -> bool {
        if self.holds_marker(kind) {
            return false;
        }
        match kind {
            HarvestKind::Pricing => {
                present(&self.price) && present(&self.contractor) && present(&self.contract_number)
            }
            HarvestKind::Sin => present(&self.sin),
        }
    }

    pub fn holds_marker(&self, kind: HarvestKind) -> bool {
        match kind {
            HarvestKind::Pricing => is_marker(&self.contractor, PRICING_NOT_FOUND),
            HarvestKind::Sin => is_marker(&self.sin, SIN_NOT_FOUND),
        }
    }

    /// Writes the proposed values into empty sub-fields only. Returns how many
    /// sub-fields changed.
    pub fn apply(&mut self, fill: &SlotFill) -> usize {
        fn write(target: &mut Option<String>, value: &Option<String>) -> usize {
            if present(target) || !present(value) {
                return 0;
            }
            *target = value.as_ref().map(|v| v.trim().to_string());
            1
        }
        write(&mut self.price, &fill.price)
            + write(&mut self.contractor, &fill.contractor)
            + write(&mut self.contract_number, &fill.contract_number)
            + write(&mut self.sin, &fill.sin)
    }

    fn clear_marker(&mut self, kind: HarvestKind) -> bool {
        if !self.holds_marker(kind) {
            return false;
        }
        match kind {
            HarvestKind::Pricing => self.contractor = None,
            HarvestKind::Sin => self.sin = None,
        }
        true
    }
}

/// Coarse per-record state used by status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Untouched,
    Partial,
    Complete,
    NotFound,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// 1-based data row number in the store.
    pub row: usize,
    pub item_number: String,
    pub stock_number: Option<String>,
    pub manufacturer: String,
    pub unit: String,
    pub search_ref: Option<String>,
    pub detail_refs: [Option<String>; SLOT_COUNT],
    pub slots: [MatchSlot; SLOT_COUNT],
}

impl Record {
    pub fn new(
        row: usize,
        item_number: impl Into<String>,
        manufacturer: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            row,
            item_number: item_number.into(),
            stock_number: None,
            manufacturer: manufacturer.into(),
            unit: unit.into(),
            search_ref: None,
            detail_refs: Default::default(),
            slots: Default::default(),
        }
    }

    pub fn with_search_ref(mut self, search_ref: impl Into<String>) -> Self {
        self.search_ref = Some(search_ref.into());
        self
    }

    /// Reason a row cannot be harvested, if any.
    pub fn defect(&self) -> Option<&'static str> {
        if self.item_number.trim().is_empty() {
            return Some("missing item number");
        }
        if self.manufacturer.trim().is_empty() {
            return Some("missing manufacturer");
        }
        if !present(&self.search_ref) && !self.detail_refs.iter().any(present) {
            return Some("missing search reference");
        }
        None
    }

    pub fn detail_refs(&self) -> impl Iterator<Item = &str> {
        self.detail_refs
            .iter()
            .filter_map(|r| r.as_deref())
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    pub fn filled_slots(&self, kind: HarvestKind) -> usize {
        self.slots.iter().filter(|s| s.is_filled(kind)).count()
    }

    pub fn open_slots(&self, kind: HarvestKind) -> usize {
        self.slots.iter().filter(|s| s.is_open(kind)).count()
    }

    pub fn has_not_found(&self, kind: HarvestKind) -> bool {
        self.slots.iter().any(|s| s.holds_marker(kind))
    }

    /// True when any slot holds a value (or marker) for the kind.
    pub fn has_any_value(&self, kind: HarvestKind) -> bool {
        self.open_slots(kind) < SLOT_COUNT
    }

    pub fn has_contract(&self, contract_number: &str) -> bool {
        let wanted = contract_number.trim();
        !wanted.is_empty()
            && self.slots.iter().any(|s| {
                s.contract_number
                    .as_deref()
                    .is_some_and(|c| c.trim().eq_ignore_ascii_case(wanted))
            })
    }

    pub fn has_sin(&self, sin: &str) -> bool {
        let wanted = sin.trim();
        !wanted.is_empty()
            && self
                .slots
                .iter()
                .any(|s| s.sin.as_deref().is_some_and(|v| v.trim().eq_ignore_ascii_case(wanted)))
    }

    /// Places complete fills into the first open slots, in order. Incomplete
    /// fills are ignored. Returns the 1-based ordinals written.
    pub fn fill_open_slots(&mut self, kind: HarvestKind, fills: &[SlotFill]) -> Vec<usize> {
        let mut written = Vec::new();
        let mut pending = fills.iter().filter(|f| f.is_complete_for(kind));
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_open(kind) {
                continue;
            }
            let Some(fill) = pending.next() else {
                break;
            };
            if slot.apply(fill) > 0 {
                written.push(idx + 1);
            }
        }
        written
    }

    /// Records an attempted-but-empty harvest in the first open slot, which
    /// is slot 1 for an untouched record. Never displaces data; returns false
    /// when no slot is open.
    pub fn mark_not_found(&mut self, kind: HarvestKind) -> bool {
        match self.slots.iter_mut().find(|s| s.is_open(kind)) {
            Some(slot) => slot.apply(&SlotFill::not_found(kind)) > 0,
            None => false,
        }
    }

    pub fn clear_not_found(&mut self, kind: HarvestKind) -> bool {
        let mut cleared = false;
        for slot in &mut self.slots {
            cleared |= slot.clear_marker(kind);
        }
        cleared
    }

    pub fn status(&self, kind: HarvestKind) -> RecordStatus {
        if self.has_not_found(kind) {
            RecordStatus::NotFound
        } else if self.open_slots(kind) == 0 {
            RecordStatus::Complete
        } else if self.has_any_value(kind) {
            RecordStatus::Partial
        } else {
            RecordStatus::Untouched
        }
    }

    pub fn matches_item(&self, query: &str) -> bool {
        let query = query.trim();
        self.item_number.trim().eq_ignore_ascii_case(query)
            || self
                .stock_number
                .as_deref()
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(query))
    }
}

/// A product harvested from a results page. Lives only while its record is
/// being processed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidate {
    /// 0-based position on the page.
    pub position: usize,
    pub manufacturer: Option<String>,
    pub unit: Option<String>,
    pub raw_text: String,
    pub detail_ref: Option<String>,
}

/// Which records a run considers, and the rule that makes a record skippable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarvestMode {
    Full,
    /// 1-based inclusive row bounds.
    Range { start: usize, end: usize },
    Test { count: usize },
    Single { item: String },
    MissingOnly { from: Option<usize> },
    Sin { start: Option<usize>, end: Option<usize> },
}

impl HarvestMode {
    pub fn kind(&self) -> HarvestKind {
        match self {
            HarvestMode::Sin { .. } => HarvestKind::Sin,
            _ => HarvestKind::Pricing,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HarvestMode::Full => "full",
            HarvestMode::Range { .. } => "range",
            HarvestMode::Test { .. } => "test",
            HarvestMode::Single { .. } => "single",
            HarvestMode::MissingOnly { .. } => "missing-only",
            HarvestMode::Sin { .. } => "sin",
        }
    }

    /// Eligibility predicate. `position` is the record's 0-based position
    /// among harvestable records.
    pub fn selects(&self, position: usize, record: &Record) -> bool {
        match self {
            HarvestMode::Full => true,
            HarvestMode::Range { start, end } => (*start..=*end).contains(&record.row),
            HarvestMode::Test { count } => position < *count,
            HarvestMode::Single { item } => record.matches_item(item),
            HarvestMode::MissingOnly { from } => from.map_or(true, |f| record.row >= f),
            HarvestMode::Sin { start, end } => {
                start.map_or(true, |s| record.row >= s) && end.map_or(true, |e| record.row <= e)
            }
        }
    }

    /// Completion rule: a complete record is skipped without any I/O.
    pub fn is_complete(&self, record: &Record) -> bool {
        let kind = self.kind();
        match self {
            HarvestMode::MissingOnly { .. } | HarvestMode::Sin { .. } => record.has_any_value(kind),
            _ => record.has_not_found(kind) || record.open_slots(kind) == 0,
        }
    }
}

// Corporate forms, descriptors and geography noise dropped when deriving a root.
const REMOVABLE_TERMS: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "co", "company", "llc", "ltd", "limited", "gmbh",
    "sa", "spa", "ag", "kg", "nv", "plc", "pty", "pte", "sro", "srl", "lp", "llp", "pc",
    "products", "product", "brands", "brand", "group", "international", "industries", "industry",
    "mfg", "manufacturing", "manufacturers", "division", "div", "usa", "us", "america", "american",
    "north", "south", "europe", "european", "asia", "pacific", "the",
];

/// Lowercase with every non-alphanumeric character removed.
pub fn alnum_lower(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Lowercase with non-alphanumeric runs collapsed to single spaces.
pub fn spaced_lower(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derives the root form of a manufacturer display name: the first token that
/// is not a corporate form or descriptor, with punctuation removed so
/// hyphenated names stay whole ("Bi-Silque Inc." -> "bisilque").
pub fn root_form(name: &str) -> String {
    let tokens: Vec<String> = name
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '/' | '&' | '(' | ')' | '+' | ';'))
        .map(alnum_lower)
        .filter(|t| !t.is_empty())
        .collect();
    tokens
        .iter()
        .find(|t| !REMOVABLE_TERMS.contains(&t.as_str()))
        .or_else(|| tokens.first())
        .cloned()
        .unwrap_or_default()
}

fn is_valid_root(root: &str) -> bool {
    !root.is_empty() && root.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("root {root:?} for manufacturer {original:?} is not a lowercase alphanumeric token")]
    InvalidRoot { original: String, root: String },
    #[error("manufacturer {original:?} maps to both {first:?} and {second:?}")]
    Conflict {
        original: String,
        first: String,
        second: String,
    },
}

/// Original manufacturer name -> root form. Built once before harvesting and
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ManufacturerMapping {
    by_original: HashMap<String, String>,
    by_normalized: HashMap<String, String>,
}

impl ManufacturerMapping {
    pub fn from_pairs<I, A, B>(pairs: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut mapping = Self::default();
        for (original, root) in pairs {
            mapping.insert(original.into(), root.into())?;
        }
        Ok(mapping)
    }

    fn insert(&mut self, original: String, root: String) -> Result<(), MappingError> {
        let root = root.trim().to_string();
        if !is_valid_root(&root) {
            return Err(MappingError::InvalidRoot { original, root });
        }
        if let Some(existing) = self.by_original.get(&original) {
            if existing != &root {
                return Err(MappingError::Conflict {
                    original,
                    first: existing.clone(),
                    second: root,
                });
            }
            return Ok(());
        }
        let key = alnum_lower(&original);
        if !key.is_empty() {
            self.by_normalized.entry(key).or_insert_with(|| root.clone());
        }
        self.by_original.insert(original, root);
        Ok(())
    }

    /// Gives every listed manufacturer a root, deriving missing ones. Returns
    /// the names that produced no usable root.
    pub fn ensure_covers<'a>(
        &mut self,
        manufacturers: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut unresolved = Vec::new();
        for name in manufacturers {
            if name.trim().is_empty() || self.by_original.contains_key(name) {
                continue;
            }
            let root = root_form(name);
            if self.insert(name.to_string(), root).is_err() {
                unresolved.push(name.to_string());
            }
        }
        unresolved
    }

    pub fn root_for(&self, original: &str) -> Option<&str> {
        self.by_original.get(original).map(String::as_str)
    }

    pub fn root_for_normalized(&self, normalized: &str) -> Option<&str> {
        self.by_normalized.get(normalized).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_original.is_empty()
    }

    /// Pairs sorted by original name.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<_> = self
            .by_original
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort();
        out
    }
}
