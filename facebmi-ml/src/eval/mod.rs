//! Held-out evaluation.
//!
//! The held-out set is the last `validation_size` lines of the cropped-image
//! info file. Each line is comma-separated with the label in field 1 and the
//! image file name in field 4.

use crate::config::FacebmiConfig;
use crate::data::{ImageBatch, ManifestRecord, load_image};
use crate::error::{MlError, Result};
use crate::model::Model;
use crate::training::metrics::mean_absolute_error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const LABEL_FIELD: usize = 1;
const FILE_FIELD: usize = 4;
const MIN_FIELDS: usize = 5;

/// One parsed info-file line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoRecord {
    pub label: f32,
    pub file_name: String,
}

/// Parse one info-file line; `line_no` is 1-based and only used in errors.
pub fn parse_info_line(line_no: usize, line: &str) -> Result<InfoRecord> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < MIN_FIELDS {
        return Err(MlError::malformed(
            line_no,
            format!("expected at least {MIN_FIELDS} fields, got {}", fields.len()),
        ));
    }
    let raw = fields[LABEL_FIELD].trim();
    let label: f32 = raw
        .parse()
        .map_err(|_| MlError::malformed(line_no, format!("non-numeric label '{raw}'")))?;
    let file_name = fields[FILE_FIELD].trim();
    if file_name.is_empty() {
        return Err(MlError::malformed(line_no, "empty file name"));
    }
    Ok(InfoRecord {
        label,
        file_name: file_name.to_string(),
    })
}

/// Parse the last `count` lines of the info file.
pub fn read_held_out_records(config: &FacebmiConfig) -> Result<Vec<InfoRecord>> {
    let path = &config.cropped_imgs_info_file;
    if !path.exists() {
        return Err(MlError::not_found(format!("info file {}", path.display())));
    }
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(config.validation_size);
    if lines.len() < config.validation_size {
        tracing::warn!(
            available = lines.len(),
            requested = config.validation_size,
            "Info file is shorter than the validation size"
        );
    }
    lines[start..]
        .iter()
        .enumerate()
        .map(|(i, line)| parse_info_line(start + i + 1, line))
        .collect()
}

/// Held-out records with their images loaded into one batch.
#[derive(Debug, Clone)]
pub struct HeldOutSet {
    pub records: Vec<InfoRecord>,
    pub images: ImageBatch,
    pub labels: Vec<f32>,
}

impl HeldOutSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Load the held-out slice with every image resized to `size`.
pub fn load_held_out(config: &FacebmiConfig, size: (usize, usize)) -> Result<HeldOutSet> {
    let records = read_held_out_records(config)?;
    if records.is_empty() {
        return Err(MlError::evaluation("info file has no held-out samples"));
    }

    let (h, w) = size;
    let mut images = ImageBatch::with_capacity(h, w, records.len());
    let mut labels = Vec::with_capacity(records.len());
    for record in &records {
        let tensor = load_image(&config.cropped_imgs_dir.join(&record.file_name), size)?;
        images.push(&tensor)?;
        labels.push(record.label);
    }

    tracing::debug!(samples = records.len(), height = h, width = w, "Loaded held-out set");
    Ok(HeldOutSet {
        records,
        images,
        labels,
    })
}

/// MAE of a model over an already loaded held-out set.
pub fn evaluate(model: &dyn Model, held_out: &HeldOutSet) -> Result<f64> {
    let predictions = model.predict(&held_out.images)?;
    mean_absolute_error(&held_out.labels, &predictions)
}

/// Load the held-out slice at the configured square size, score the model,
/// print the MAE to stdout and return it.
pub fn test_model(model: &dyn Model, config: &FacebmiConfig) -> Result<f64> {
    let edge = config.default_img_width;
    let held_out = load_held_out(config, (edge, edge))?;
    let mae = evaluate(model, &held_out)?;
    tracing::info!(samples = held_out.len(), mae, "Held-out evaluation complete");
    println!("\nMAE: {mae}");
    Ok(mae)
}

/// File names that appear both in a training manifest and in the held-out
/// slice, sorted.
pub fn check_disjoint(train: &[ManifestRecord], held_out: &[InfoRecord]) -> Vec<String> {
    let held: HashSet<&str> = held_out.iter().map(|r| r.file_name.as_str()).collect();
    let mut overlap: Vec<String> = train
        .iter()
        .filter(|r| held.contains(r.name.as_str()))
        .map(|r| r.name.clone())
        .collect();
    overlap.sort();
    overlap.dedup();
    overlap
}
