//! The training loop as an explicit state machine.

use crate::data::BatchSource;
use crate::error::{MlError, Result};
use crate::model::{CompiledState, Model};
use crate::training::callbacks::{CallbackAction, TrainingCallback};
use crate::training::checkpoint::CheckpointManager;
use crate::training::metrics::{EpochLogs, History, LEARNING_RATE, LOSS, StopReason};

/// Where a fit loop is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FitState {
    Idle,
    Running { epoch: usize },
    Finished(StopReason),
    Failed(String),
}

/// Runs up to `epochs` epochs over a batch source, driving callbacks.
pub struct FitLoop {
    epochs: usize,
    monitor: String,
    state: FitState,
    checkpoint_log: Option<(CheckpointManager, String)>,
}

impl FitLoop {
    /// `monitor` names the metric `History` ranks epochs by.
    pub fn new(epochs: usize, monitor: &str) -> Self {
        Self {
            epochs,
            monitor: monitor.to_string(),
            state: FitState::Idle,
            checkpoint_log: None,
        }
    }

    /// Record every weights write in a checkpoint manifest under `run`.
    pub fn with_checkpoint_log(mut self, manager: CheckpointManager, run: &str) -> Self {
        self.checkpoint_log = Some((manager, run.to_string()));
        self
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn run(
        &mut self,
        model: &mut dyn Model,
        token: &CompiledState,
        source: &BatchSource,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> Result<History> {
        if matches!(self.state, FitState::Running { .. }) {
            return Err(MlError::training("fit loop is already running"));
        }
        match self.run_epochs(model, token, source, callbacks) {
            Ok(history) => Ok(history),
            Err(e) => {
                self.state = FitState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn run_epochs(
        &mut self,
        model: &mut dyn Model,
        token: &CompiledState,
        source: &BatchSource,
        callbacks: &mut [Box<dyn TrainingCallback>],
    ) -> Result<History> {
        let steps_per_epoch = source.batches_per_epoch();
        if steps_per_epoch == 0 {
            return Err(MlError::dataset(format!(
                "{} usable samples is less than one batch of {}",
                source.len(),
                source.batch_size()
            )));
        }

        for cb in callbacks.iter_mut() {
            cb.on_train_begin(&*model)?;
        }

        let mut history = History::new(&self.monitor);
        let mut reason = StopReason::EpochBudget;

        for epoch in 1..=self.epochs {
            self.state = FitState::Running { epoch };

            let mut total = 0.0;
            for batch in source.epoch(epoch - 1) {
                total += model.train_step(token, &batch?)?;
            }

            let mut logs = EpochLogs::new(epoch);
            logs.set(LOSS, total / steps_per_epoch as f64);
            if let Some(lr) = model.learning_rate() {
                logs.set(LEARNING_RATE, lr);
            }

            for cb in callbacks.iter_mut() {
                if let CallbackAction::SetLearningRate(lr) = cb.on_epoch_end(epoch, &mut logs, &*model)? {
                    model.set_learning_rate(lr)?;
                }
            }

            for cb in callbacks.iter_mut() {
                let Some(request) = cb.on_checkpoint(epoch, &logs) else {
                    continue;
                };
                model.save_weights(&request.path)?;
                if let Some((manager, run)) = &self.checkpoint_log {
                    manager.record(run, epoch, &request.monitor, request.value, &request.path)?;
                }
                if !history.checkpoints.contains(&request.path) {
                    history.checkpoints.push(request.path);
                }
            }

            // Every callback sees the epoch, even once one has asked to stop.
            let stop = callbacks
                .iter_mut()
                .fold(false, |stop, cb| cb.on_early_stop_check(epoch, &logs) | stop);

            tracing::info!(
                epoch,
                epochs = self.epochs,
                steps = steps_per_epoch,
                loss = logs.get(LOSS),
                monitor = logs.get(&self.monitor),
                "Epoch complete"
            );
            history.record_epoch(&logs);

            if stop {
                reason = StopReason::EarlyStopped { epoch };
                break;
            }
        }

        history.stop_reason = Some(reason.clone());
        for cb in callbacks.iter_mut() {
            cb.on_train_end(&history)?;
        }
        self.state = FitState::Finished(reason);
        Ok(history)
    }
}
