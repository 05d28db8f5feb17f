//! Training metrics: per-epoch logs and run history.

use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Mean training loss of an epoch.
pub const LOSS: &str = "loss";
/// Validation MAE over the held-out set.
pub const VAL_MAE: &str = "val_mae_0-100";
/// Learning rate in effect during the epoch.
pub const LEARNING_RATE: &str = "lr";

/// Mean absolute error between labels and predictions.
pub fn mean_absolute_error(labels: &[f32], predictions: &[f32]) -> Result<f64> {
    if labels.len() != predictions.len() {
        return Err(MlError::evaluation(format!(
            "{} labels but {} predictions",
            labels.len(),
            predictions.len()
        )));
    }
    if labels.is_empty() {
        return Err(MlError::evaluation("no samples to score"));
    }
    let total: f64 = labels
        .iter()
        .zip(predictions)
        .map(|(y, p)| (*y as f64 - *p as f64).abs())
        .sum();
    Ok(total / labels.len() as f64)
}

/// Metric values of one epoch, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub epoch: usize,
    values: Vec<(String, f64)>,
}

impl EpochLogs {
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            values: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: f64) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Why a fit loop finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    EpochBudget,
    EarlyStopped { epoch: usize },
}

/// Metric history of one fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub monitor: String,
    pub epochs_completed: usize,
    pub series: BTreeMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_value: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
    pub stop_reason: Option<StopReason>,
}

impl History {
    /// Track the lowest value of `monitor`. Epochs that did not report it
    /// never become the best epoch.
    pub fn new(monitor: &str) -> Self {
        Self {
            monitor: monitor.to_string(),
            epochs_completed: 0,
            series: BTreeMap::new(),
            best_epoch: None,
            best_value: None,
            checkpoints: Vec::new(),
            stop_reason: None,
        }
    }

    pub fn record_epoch(&mut self, logs: &EpochLogs) {
        for (key, value) in logs.iter() {
            self.series.entry(key.to_string()).or_default().push(value);
        }
        self.epochs_completed += 1;

        if let Some(value) = logs.get(&self.monitor) {
            if self.best_value.is_none_or(|best| value < best) {
                self.best_value = Some(value);
                self.best_epoch = Some(logs.epoch);
            }
        }
    }

    pub fn values(&self, key: &str) -> &[f64] {
        self.series.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last(&self, key: &str) -> Option<f64> {
        self.values(key).last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mae_of_zero_predictions_is_mean_abs_label() {
        let labels = [20.0, 30.0, 25.0];
        let mae = mean_absolute_error(&labels, &[0.0; 3]).unwrap();
        assert!((mae - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_mae_length_mismatch() {
        assert!(mean_absolute_error(&[1.0], &[1.0, 2.0]).is_err());
        assert!(mean_absolute_error(&[], &[]).is_err());
    }

    #[test]
    fn test_logs_overwrite_keeps_order() {
        let mut logs = EpochLogs::new(1);
        logs.set(LOSS, 3.0);
        logs.set(VAL_MAE, 4.0);
        logs.set(LOSS, 2.5);
        let keys: Vec<&str> = logs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![LOSS, VAL_MAE]);
        assert_eq!(logs.get(LOSS), Some(2.5));
    }

    #[test]
    fn test_history_ignores_other_metrics_for_best() {
        let mut history = History::new(VAL_MAE);
        let mut first = EpochLogs::new(1);
        first.set(LOSS, 0.5);
        first.set(VAL_MAE, 6.0);
        history.record_epoch(&first);
        // A lower training loss without a validation value is not a new best.
        history.record_epoch(&logs_with_loss(2, 0.1));
        assert_eq!(history.best_epoch, Some(1));
        assert_eq!(history.best_value, Some(6.0));

        let mut only_loss = History::new(VAL_MAE);
        only_loss.record_epoch(&logs_with_loss(1, 0.1));
        assert_eq!(only_loss.best_epoch, None);
        assert_eq!(only_loss.epochs_completed, 1);
    }

    fn logs_with_loss(epoch: usize, loss: f64) -> EpochLogs {
        let mut logs = EpochLogs::new(epoch);
        logs.set(LOSS, loss);
        logs
    }

    #[test]
    fn test_history_tracks_best_monitor() {
        let mut history = History::new(VAL_MAE);
        for (epoch, (loss, val)) in [(5.0, 6.0), (4.0, 4.5), (3.0, 4.8)].iter().enumerate() {
            let mut logs = EpochLogs::new(epoch + 1);
            logs.set(LOSS, *loss);
            logs.set(VAL_MAE, *val);
            history.record_epoch(&logs);
        }
        assert_eq!(history.epochs_completed, 3);
        assert_eq!(history.best_epoch, Some(2));
        assert_eq!(history.best_value, Some(4.5));
        assert_eq!(history.values(LOSS), &[5.0, 4.0, 3.0]);
        assert_eq!(history.last(VAL_MAE), Some(4.8));
    }
}
