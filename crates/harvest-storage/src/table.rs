//! Tabular record store backed by a CSV file, with keyword-based column
//! resolution.

use harvest_core::{MatchSlot, Record, SLOT_COUNT};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("required column {0:?} not found in store headers")]
    MissingColumn(&'static str),
    #[error("store has no header row")]
    NoHeaders,
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping error: {0}")]
    Mapping(#[from] harvest_core::MappingError),
}

/// Row/column counts of a table, used to validate saved files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableShape {
    pub rows: usize,
    pub columns: usize,
}

impl std::fmt::Display for TableShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rows x {} columns", self.rows, self.columns)
    }
}

/// Raw cells. Every row is padded to the header width.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes);
        let headers: Vec<String> = reader.headers()?.iter().map(ToString::to_string).collect();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(StoreError::NoHeaders);
        }
        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            let mut row: Vec<String> = record.iter().map(ToString::to_string).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| StoreError::Csv(csv::Error::from(e.into_error())))
    }

    fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name)) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }
}

/// Header-matching rule: exact names win, then the first header containing
/// every fragment and none of the exclusions (all case-insensitive).
struct ColumnRule {
    exact: &'static [&'static str],
    all_of: &'static [&'static str],
    none_of: &'static [&'static str],
}

impl ColumnRule {
    fn resolve(&self, headers: &[String]) -> Option<usize> {
        let lowered: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        lowered
            .iter()
            .position(|h| self.exact.contains(&h.as_str()))
            .or_else(|| {
                if self.all_of.is_empty() {
                    return None;
                }
                lowered.iter().position(|h| {
                    self.all_of.iter().all(|f| h.contains(f))
                        && !self.none_of.iter().any(|f| h.contains(f))
                })
            })
    }
}

const ITEM_NUMBER: ColumnRule = ColumnRule {
    exact: &["item number"],
    all_of: &["item number"],
    none_of: &["stock"],
};
const STOCK_NUMBER: ColumnRule = ColumnRule {
    exact: &[],
    all_of: &["item stock number", "butted"],
    none_of: &[],
};
const MANUFACTURER: ColumnRule = ColumnRule {
    exact: &["manufacturer", "manufacturer name", "mfr"],
    all_of: &["manufacturer"],
    none_of: &["part"],
};
const UNIT: ColumnRule = ColumnRule {
    exact: &["unit of measure", "uom", "unit"],
    all_of: &["unit of measure"],
    none_of: &[],
};
const SEARCH_REF: ColumnRule = ColumnRule {
    exact: &["links", "link", "gsa link"],
    all_of: &["link"],
    none_of: &["direct"],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotColumns {
    pub price: usize,
    pub contractor: usize,
    pub contract_number: usize,
    pub sin: usize,
}

/// Resolved column positions for the record fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub item_number: usize,
    pub stock_number: Option<usize>,
    pub manufacturer: usize,
    pub unit: usize,
    pub search_ref: Option<usize>,
    pub detail_refs: [Option<usize>; SLOT_COUNT],
    pub slots: [SlotColumns; SLOT_COUNT],
}

/// Legacy spreadsheet naming: the first ordinal has no suffix, later ones
/// get `.1`, `.2`.
fn legacy_name(base: &str, ordinal: usize) -> String {
    if ordinal == 1 {
        base.to_string()
    } else {
        format!("{base}.{}", ordinal - 1)
    }
}

fn find_any(headers: &[String], names: &[String]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
}

fn resolve_slot_column(table: &mut Table, canonical: String, aliases: Vec<String>) -> usize {
    let mut names = vec![canonical.clone()];
    names.extend(aliases);
    match find_any(&table.headers, &names) {
        Some(idx) => idx,
        None => {
            debug!(column = %canonical, "appending missing slot column");
            table.ensure_column(&canonical)
        }
    }
}

impl ColumnMap {
    /// Resolves identifier columns and appends any missing slot columns.
    pub fn resolve(table: &mut Table) -> Result<Self, StoreError> {
        let headers = &table.headers;
        let item_number = ITEM_NUMBER
            .resolve(headers)
            .ok_or(StoreError::MissingColumn("item number"))?;
        let manufacturer = MANUFACTURER
            .resolve(headers)
            .ok_or(StoreError::MissingColumn("manufacturer"))?;
        let unit = UNIT.resolve(headers).ok_or(StoreError::MissingColumn("unit of measure"))?;
        let stock_number = STOCK_NUMBER.resolve(headers);
        let search_ref = SEARCH_REF.resolve(headers);

        let direct: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.to_lowercase().contains("direct product link"))
            .map(|(i, _)| i)
            .take(SLOT_COUNT)
            .collect();
        let mut detail_refs = [None; SLOT_COUNT];
        for (slot, idx) in direct.into_iter().enumerate() {
            detail_refs[slot] = Some(idx);
        }

        let mut slots = Vec::with_capacity(SLOT_COUNT);
        for k in 1..=SLOT_COUNT {
            let price = resolve_slot_column(
                table,
                format!("price_{k}"),
                vec![format!("gsa_price_{k}"), legacy_name("gsa price", k)],
            );
            let contractor = resolve_slot_column(
                table,
                format!("contractor_{k}"),
                vec![format!("gsa_contractor_{k}"), legacy_name("contractor", k)],
            );
            let contract_number = resolve_slot_column(
                table,
                format!("contract_number_{k}"),
                vec![format!("gsa_contract_{k}"), legacy_name("contract#:", k)],
            );
            let sin = resolve_slot_column(table, format!("sin_{k}"), vec![format!("sin{k}")]);
            slots.push(SlotColumns {
                price,
                contractor,
                contract_number,
                sin,
            });
        }

        Ok(Self {
            item_number,
            stock_number,
            manufacturer,
            unit,
            search_ref,
            detail_refs,
            slots: [slots[0], slots[1], slots[2]],
        })
    }
}

fn cell(row: &[String], idx: usize) -> Option<String> {
    let value = row.get(idx)?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(value.to_string())
    }
}

/// A row left out of harvesting, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedRow {
    pub row: usize,
    pub reason: String,
}

/// In-memory store: the raw table plus typed records for harvestable rows.
/// Slot values live on the records and are written back by [`RecordStore::render`].
#[derive(Debug, Clone)]
pub struct RecordStore {
    table: Table,
    columns: ColumnMap,
    records: Vec<Record>,
    excluded: Vec<ExcludedRow>,
}

impl RecordStore {
    pub fn from_table(mut table: Table) -> Result<Self, StoreError> {
        let columns = ColumnMap::resolve(&mut table)?;
        let mut records = Vec::with_capacity(table.rows.len());
        let mut excluded = Vec::new();

        for (idx, row) in table.rows.iter().enumerate() {
            let record = Self::record_from_row(&columns, idx + 1, row);
            match record.defect() {
                Some(reason) => {
                    warn!(row = record.row, reason, "excluding malformed row");
                    excluded.push(ExcludedRow {
                        row: record.row,
                        reason: reason.to_string(),
                    });
                }
                None => records.push(record),
            }
        }

        Ok(Self {
            table,
            columns,
            records,
            excluded,
        })
    }

    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Self::from_table(Table::from_csv_bytes(bytes)?)
    }

    fn record_from_row(columns: &ColumnMap, row_no: usize, row: &[String]) -> Record {
        let mut record = Record::new(
            row_no,
            cell(row, columns.item_number).unwrap_or_default(),
            cell(row, columns.manufacturer).unwrap_or_default(),
            cell(row, columns.unit).unwrap_or_default(),
        );
        record.stock_number = columns.stock_number.and_then(|i| cell(row, i));
        record.search_ref = columns.search_ref.and_then(|i| cell(row, i));
        for (slot, idx) in columns.detail_refs.iter().enumerate() {
            record.detail_refs[slot] = idx.and_then(|i| cell(row, i));
        }
        for (slot, cols) in columns.slots.iter().enumerate() {
            record.slots[slot] = MatchSlot {
                price: cell(row, cols.price),
                contractor: cell(row, cols.contractor),
                contract_number: cell(row, cols.contract_number),
                sin: cell(row, cols.sin),
            };
        }
        record
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn excluded(&self) -> &[ExcludedRow] {
        &self.excluded
    }

    /// Shape every rendered table has; validation compares against this.
    pub fn shape(&self) -> TableShape {
        TableShape {
            rows: self.table.rows.len(),
            columns: self.table.headers.len(),
        }
    }

    /// Table with record slot values written into their columns. Columns the
    /// store does not understand are carried through untouched.
    pub fn render(&self) -> Table {
        let mut table = self.table.clone();
        for record in &self.records {
            let Some(row) = table.rows.get_mut(record.row - 1) else {
                continue;
            };
            for (slot, cols) in record.slots.iter().zip(self.columns.slots.iter()) {
                row[cols.price] = slot.price.clone().unwrap_or_default();
                row[cols.contractor] = slot.contractor.clone().unwrap_or_default();
                row[cols.contract_number] = slot.contract_number.clone().unwrap_or_default();
                row[cols.sin] = slot.sin.clone().unwrap_or_default();
            }
        }
        table
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, StoreError> {
        self.render().to_csv_bytes()
    }

    /// Unique manufacturer names in row order.
    pub fn manufacturers(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.records
            .iter()
            .map(|r| r.manufacturer.as_str())
            .filter(|m| seen.insert(*m))
            .collect()
    }
}
