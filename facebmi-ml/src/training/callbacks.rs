//! Training callbacks: validation MAE, early stopping, checkpointing,
//! learning-rate reduction, and scalar logging.
//!
//! The fit loop drives every callback through three hook points per epoch,
//! always in this order: `on_epoch_end` (all callbacks), `on_checkpoint`
//! (all callbacks), then `on_early_stop_check` (all callbacks).

use crate::data::ImageBatch;
use crate::error::Result;
use crate::eval::HeldOutSet;
use crate::model::Model;
use crate::training::metrics::{EpochLogs, History, VAL_MAE, mean_absolute_error};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Action a callback can request at the end of an epoch.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    Continue,
    SetLearningRate(f64),
}

/// A request to write the model weights.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    pub path: PathBuf,
    pub monitor: String,
    pub value: Option<f64>,
}

/// Direction in which a monitored metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    fn improved(self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Self::Min => current < best - min_delta,
            Self::Max => current > best + min_delta,
        }
    }
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_train_begin(&mut self, _model: &dyn Model) -> Result<()> {
        Ok(())
    }

    /// Called at the end of each epoch; may add metrics to `logs`.
    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _logs: &mut EpochLogs,
        _model: &dyn Model,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_checkpoint(&mut self, _epoch: usize, _logs: &EpochLogs) -> Option<CheckpointRequest> {
        None
    }

    fn on_early_stop_check(&mut self, _epoch: usize, _logs: &EpochLogs) -> bool {
        false
    }

    fn on_train_end(&mut self, _history: &History) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MaeCallback
// ---------------------------------------------------------------------------

/// Scores the model on a held-out set and publishes `val_mae_0-100`.
pub struct MaeCallback {
    images: ImageBatch,
    labels: Vec<f32>,
}

impl MaeCallback {
    pub fn new(held_out: HeldOutSet) -> Self {
        Self {
            images: held_out.images,
            labels: held_out.labels,
        }
    }
}

impl TrainingCallback for MaeCallback {
    fn name(&self) -> &'static str {
        "mae"
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        logs: &mut EpochLogs,
        model: &dyn Model,
    ) -> Result<CallbackAction> {
        let predictions = model.predict(&self.images)?;
        let mae = mean_absolute_error(&self.labels, &predictions)?;
        logs.set(VAL_MAE, mae);
        Ok(CallbackAction::Continue)
    }
}

// ---------------------------------------------------------------------------
// EarlyStopping
// ---------------------------------------------------------------------------

/// Early stopping callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor: String,
    pub mode: Mode,
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    wait: usize,
    #[serde(skip)]
    best: Option<f64>,
    #[serde(skip)]
    warned: bool,
}

impl EarlyStopping {
    pub fn new(monitor: &str, mode: Mode, patience: usize) -> Self {
        Self {
            monitor: monitor.to_string(),
            mode,
            patience,
            min_delta: 0.0,
            wait: 0,
            best: None,
            warned: false,
        }
    }

    /// Feed one observation; returns `true` when training should stop.
    pub fn observe(&mut self, value: f64) -> bool {
        match self.best {
            None => {
                self.best = Some(value);
                false
            }
            Some(best) => {
                if self.mode.improved(value, best, self.min_delta) {
                    self.best = Some(value);
                    self.wait = 0;
                    false
                } else {
                    self.wait += 1;
                    self.wait >= self.patience
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn on_train_begin(&mut self, _model: &dyn Model) -> Result<()> {
        self.wait = 0;
        self.best = None;
        Ok(())
    }

    fn on_early_stop_check(&mut self, epoch: usize, logs: &EpochLogs) -> bool {
        let Some(value) = logs.get(&self.monitor) else {
            if !self.warned {
                tracing::warn!(monitor = %self.monitor, "Early stopping metric not reported");
                self.warned = true;
            }
            return false;
        };
        let stop = self.observe(value);
        if stop {
            tracing::info!(
                epoch,
                monitor = %self.monitor,
                patience = self.patience,
                "Early stopping"
            );
        }
        stop
    }
}

// ---------------------------------------------------------------------------
// ModelCheckpoint
// ---------------------------------------------------------------------------

/// Requests a weights write when the monitored metric improves.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    pub path: PathBuf,
    pub monitor: String,
    pub mode: Mode,
    pub save_best_only: bool,
    best: Option<f64>,
}

impl ModelCheckpoint {
    pub fn best_only(path: PathBuf, monitor: &str, mode: Mode) -> Self {
        Self {
            path,
            monitor: monitor.to_string(),
            mode,
            save_best_only: true,
            best: None,
        }
    }
}

impl TrainingCallback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "model_checkpoint"
    }

    fn on_checkpoint(&mut self, epoch: usize, logs: &EpochLogs) -> Option<CheckpointRequest> {
        let value = logs.get(&self.monitor);
        let request = CheckpointRequest {
            path: self.path.clone(),
            monitor: self.monitor.clone(),
            value,
        };
        if !self.save_best_only {
            return Some(request);
        }

        let Some(current) = value else {
            tracing::warn!(monitor = %self.monitor, "Can save best model only with metric available, skipping");
            return None;
        };
        if self.best.is_none_or(|best| self.mode.improved(current, best, 0.0)) {
            tracing::info!(
                epoch,
                monitor = %self.monitor,
                from = ?self.best,
                to = current,
                path = %self.path.display(),
                "Metric improved, saving weights"
            );
            self.best = Some(current);
            Some(request)
        } else {
            tracing::debug!(epoch, monitor = %self.monitor, "Metric did not improve");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// ReduceLrOnPlateau
// ---------------------------------------------------------------------------

/// Reduces the learning rate when a metric stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    pub monitor: String,
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    pub min_delta: f64,
    wait: usize,
    best: Option<f64>,
}

impl ReduceLrOnPlateau {
    pub fn new(monitor: &str, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            monitor: monitor.to_string(),
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            wait: 0,
            best: None,
        }
    }

    /// Feed one observation at the current learning rate; returns the new
    /// learning rate when a reduction is due.
    pub fn observe(&mut self, value: f64, current_lr: f64) -> Option<f64> {
        if self.best.is_none_or(|best| Mode::Min.improved(value, best, self.min_delta)) {
            self.best = Some(value);
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience || current_lr <= self.min_lr {
            return None;
        }
        self.wait = 0;
        Some((current_lr * self.factor).max(self.min_lr))
    }
}

impl TrainingCallback for ReduceLrOnPlateau {
    fn name(&self) -> &'static str {
        "reduce_lr_on_plateau"
    }

    fn on_train_begin(&mut self, _model: &dyn Model) -> Result<()> {
        self.wait = 0;
        self.best = None;
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        model: &dyn Model,
    ) -> Result<CallbackAction> {
        let (Some(value), Some(lr)) = (logs.get(&self.monitor), model.learning_rate()) else {
            return Ok(CallbackAction::Continue);
        };
        match self.observe(value, lr) {
            Some(new_lr) => {
                tracing::info!(epoch, from = lr, to = new_lr, "Reducing learning rate");
                Ok(CallbackAction::SetLearningRate(new_lr))
            }
            None => Ok(CallbackAction::Continue),
        }
    }
}

// ---------------------------------------------------------------------------
// ScalarLogger
// ---------------------------------------------------------------------------

pub const SCALARS_FILE: &str = "scalars.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub epoch: usize,
    pub tag: String,
    pub value: f64,
    pub wall_time: f64,
}

/// Appends every epoch metric to `<log_dir>/scalars.jsonl`.
pub struct ScalarLogger {
    log_dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl ScalarLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            writer: None,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

impl TrainingCallback for ScalarLogger {
    fn name(&self) -> &'static str {
        "scalar_logger"
    }

    fn on_train_begin(&mut self, _model: &dyn Model) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        let file = File::create(self.log_dir.join(SCALARS_FILE))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        _model: &dyn Model,
    ) -> Result<CallbackAction> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(CallbackAction::Continue);
        };
        let wall_time = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        for (tag, value) in logs.iter() {
            let event = ScalarEvent {
                epoch,
                tag: tag.to_string(),
                value,
                wall_time,
            };
            serde_json::to_writer(&mut *writer, &event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self, _history: &History) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
