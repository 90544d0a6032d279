//! `original,root` CSV persistence for the manufacturer mapping.

use std::path::Path;

use harvest_core::ManufacturerMapping;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{write_atomic, PersistenceError};
use crate::table::StoreError;

#[derive(Debug, Serialize, Deserialize)]
struct MappingRow {
    original: String,
    root: String,
}

pub fn parse_mapping_csv(bytes: &[u8]) -> Result<ManufacturerMapping, StoreError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(bytes);
    let mut pairs = Vec::new();
    for row in reader.deserialize::<MappingRow>() {
        let row = row?;
        if row.original.is_empty() {
            continue;
        }
        pairs.push((row.original, row.root));
    }
    Ok(ManufacturerMapping::from_pairs(pairs)?)
}

/// Reads a mapping file. A missing file yields an empty mapping.
pub async fn load_mapping_csv(path: &Path) -> Result<ManufacturerMapping, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => parse_mapping_csv(&bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(ManufacturerMapping::default())
        }
        Err(source) => Err(StoreError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

pub fn render_mapping_csv(mapping: &ManufacturerMapping) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for (original, root) in mapping.pairs() {
        writer.serialize(MappingRow {
            original: original.to_string(),
            root: root.to_string(),
        })?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Csv(csv::Error::from(e.into_error())))
}

pub async fn write_mapping_csv(
    path: &Path,
    mapping: &ManufacturerMapping,
) -> Result<(), PersistenceError> {
    let bytes = render_mapping_csv(mapping)?;
    write_atomic(path, &bytes).await
}
