//! Training manifest parsing.
//!
//! A manifest is a headered CSV with one row per image. Only the `name` and
//! `bmi` columns are consumed; any other columns (pandas index, sex, age...)
//! are ignored.

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const NAME_COLUMN: &str = "name";
pub const LABEL_COLUMN: &str = "bmi";

/// One manifest row: an image file name and its regression target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub name: String,
    pub bmi: f32,
}

/// Read a manifest CSV from disk.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRecord>> {
    if !path.exists() {
        return Err(MlError::not_found(format!("manifest {}", path.display())));
    }
    let content = std::fs::read_to_string(path)?;
    parse_manifest(&content)
}

fn csv_error(err: csv::Error, fallback_line: usize) -> MlError {
    let line = err
        .position()
        .map_or(fallback_line, |p| p.line() as usize);
    MlError::malformed(line, err.to_string())
}

/// Parse manifest contents. Fields may be quoted as pandas writes them;
/// blank lines are skipped and anything else that cannot be read is fatal.
pub fn parse_manifest(content: &str) -> Result<Vec<ManifestRecord>> {
    if content.trim().is_empty() {
        return Err(MlError::dataset("Empty manifest file"));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());
    let headers = reader.headers().map_err(|e| csv_error(e, 1))?.clone();
    for wanted in [NAME_COLUMN, LABEL_COLUMN] {
        if !headers.iter().any(|h| h == wanted) {
            return Err(MlError::malformed(1, format!("missing column '{wanted}'")));
        }
    }

    let mut records = Vec::new();
    let mut row = csv::StringRecord::new();
    while reader.read_record(&mut row).map_err(|e| csv_error(e, 0))? {
        let line_no = row.position().map_or(0, |p| p.line() as usize);
        let record: ManifestRecord = row
            .deserialize(Some(&headers))
            .map_err(|e| MlError::malformed(line_no, e.to_string()))?;
        if record.name.is_empty() {
            return Err(MlError::malformed(line_no, "empty image name"));
        }
        records.push(record);
    }

    Ok(records)
}
