//! Checkpoint bookkeeping for training runs.
//!
//! Weight files are written by the model itself. This module keeps one
//! `<run>.checkpoints.json` manifest per run label next to them, recording
//! when each file was written, for which monitored value, and a content hash.
//! Runs sharing a weights directory never touch each other's manifest.

use crate::error::{MlError, Result};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST_SUFFIX: &str = "checkpoints.json";

/// One written checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Phase label of the run, e.g. `resnet_<ts>_top_layer`.
    pub run: String,
    pub epoch: usize,
    pub monitor: String,
    pub value: Option<f64>,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            base_dir,
            max_checkpoints,
        }
    }

    /// `<base_dir>/<run>.checkpoints.json`
    pub fn manifest_path(&self, run: &str) -> PathBuf {
        self.base_dir.join(format!("{run}.{MANIFEST_SUFFIX}"))
    }

    /// List checkpoints recorded for a run label, oldest first.
    pub fn list(&self, run: &str) -> Result<Vec<Checkpoint>> {
        Ok(persist::load_json(&self.manifest_path(run))?.unwrap_or_default())
    }

    /// Get the best checkpoint (lowest monitored value) of a run.
    pub fn best(&self, run: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.list(run)?;
        Ok(checkpoints
            .into_iter()
            .filter(|c| c.value.is_some())
            .min_by(|a, b| {
                a.value
                    .partial_cmp(&b.value)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }))
    }

    /// Record a weights file that has just been written.
    pub fn record(
        &self,
        run: &str,
        epoch: usize,
        monitor: &str,
        value: Option<f64>,
        path: &Path,
    ) -> Result<Checkpoint> {
        let bytes = std::fs::read(path).map_err(|e| {
            MlError::training(format!("checkpoint {} unreadable: {e}", path.display()))
        })?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            run: run.to_string(),
            epoch,
            monitor: monitor.to_string(),
            value,
            path: path.to_path_buf(),
            hash,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list(run)?;
        checkpoints.push(checkpoint.clone());

        // Enforce max_checkpoints by removing oldest entries.
        while checkpoints.len() > self.max_checkpoints {
            checkpoints.remove(0);
        }

        persist::atomic_write_json(&self.manifest_path(run), &checkpoints)?;

        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 10);
        let weights = dir.path().join("run_top_layer.h5");

        std::fs::write(&weights, b"epoch1").unwrap();
        manager.record("run_top_layer", 1, "val_mae_0-100", Some(6.0), &weights).unwrap();
        std::fs::write(&weights, b"epoch2!").unwrap();
        let second = manager
            .record("run_top_layer", 2, "val_mae_0-100", Some(5.0), &weights)
            .unwrap();
        manager.record("other_run", 1, "val_mae_0-100", Some(1.0), &weights).unwrap();

        assert_eq!(second.size_bytes, 7);
        assert_eq!(manager.list("run_top_layer").unwrap().len(), 2);
        let best = manager.best("run_top_layer").unwrap().unwrap();
        assert_eq!(best.epoch, 2);
        assert_eq!(best.hash, second.hash);
    }

    #[test]
    fn test_max_checkpoints_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 2);
        let weights = dir.path().join("w.h5");
        std::fs::write(&weights, b"w").unwrap();
        for epoch in 1..=3 {
            manager.record("r", epoch, "loss", Some(1.0), &weights).unwrap();
        }
        let epochs: Vec<usize> = manager.list("r").unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![2, 3]);
    }

    #[test]
    fn test_runs_sharing_a_directory_keep_their_own_entries() {
        let dir = tempfile::tempdir().unwrap();
        let handles: Vec<_> = ["a_top_layer", "b_top_layer"]
            .into_iter()
            .map(|run| {
                let base = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let manager = CheckpointManager::new(base.clone(), 100);
                    let weights = base.join(format!("{run}.h5"));
                    std::fs::write(&weights, run.as_bytes()).unwrap();
                    for epoch in 1..=30 {
                        manager
                            .record(run, epoch, "val_mae_0-100", Some(epoch as f64), &weights)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let manager = CheckpointManager::new(dir.path().to_path_buf(), 100);
        assert_eq!(manager.list("a_top_layer").unwrap().len(), 30);
        assert_eq!(manager.list("b_top_layer").unwrap().len(), 30);
        assert_eq!(manager.best("a_top_layer").unwrap().unwrap().epoch, 1);
        assert!(
            manager
                .manifest_path("a_top_layer")
                .ends_with("a_top_layer.checkpoints.json")
        );
    }

    #[test]
    fn test_missing_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf(), 2);
        let err = manager
            .record("r", 1, "loss", None, &dir.path().join("absent.h5"))
            .unwrap_err();
        assert!(matches!(err, MlError::Training(_)));
    }
}
