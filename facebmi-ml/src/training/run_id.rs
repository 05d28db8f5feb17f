//! Per-invocation run identifiers and the file paths derived from them.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%6f";

/// Fine-tuning phase; names the suffix of weight and log paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    TopLayer,
    AllLayers,
}

impl Phase {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::TopLayer => "top_layer",
            Self::AllLayers => "all_layers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// `<model_name>_<timestamp>`, fixed for the lifetime of one trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId {
    model_name: String,
    timestamp: String,
}

impl RunId {
    pub fn new(model_name: &str) -> Self {
        Self::with_timestamp(model_name, &Local::now().format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn with_timestamp(model_name: &str, timestamp: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Label of one phase of this run, e.g. `resnet_<ts>_top_layer`.
    pub fn phase_label(&self, phase: Phase) -> String {
        format!("{self}_{}", phase.suffix())
    }

    /// `<weights_dir>/<run>_<phase>.h5`
    pub fn weights_path(&self, weights_dir: &Path, phase: Phase) -> PathBuf {
        weights_dir.join(format!("{}.h5", self.phase_label(phase)))
    }

    /// `<log_dir>/<group>/<run>_<phase>`
    pub fn log_dir(&self, log_dir: &Path, group: &str, phase: Phase) -> PathBuf {
        log_dir.join(group).join(self.phase_label(phase))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.model_name, self.timestamp)
    }
}
