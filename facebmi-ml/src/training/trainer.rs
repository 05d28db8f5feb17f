//! Two-phase fine-tuning: top layer only, then the whole network.

use crate::config::FacebmiConfig;
use crate::data::{BatchSource, read_manifest};
use crate::error::{MlError, Result};
use crate::eval::{self, HeldOutSet};
use crate::model::{LayerSelector, Loss, Model, Optimizer, spatial_input_size};
use crate::training::callbacks::{
    EarlyStopping, MaeCallback, Mode, ModelCheckpoint, ReduceLrOnPlateau, ScalarLogger,
    TrainingCallback,
};
use crate::training::checkpoint::CheckpointManager;
use crate::training::fit::FitLoop;
use crate::training::metrics::{History, LOSS, VAL_MAE};
use crate::training::run_id::{Phase, RunId};

pub const LOSS_FN: Loss = Loss::MeanAbsoluteError;
pub const LEARNING_RATE: f64 = 0.001;

const MAX_MANIFEST_CHECKPOINTS: usize = 200;

/// Reduce-on-plateau settings of a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauPlan {
    pub monitor: &'static str,
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
}

/// Everything that differs between the two fine-tuning phases.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub phase: Phase,
    /// Trainability change applied before recompiling.
    pub trainability: (LayerSelector, bool),
    pub epochs: usize,
    pub early_stopping_patience: usize,
    pub reduce_lr: Option<PlateauPlan>,
}

impl PhasePlan {
    pub fn top_layer() -> Self {
        Self {
            phase: Phase::TopLayer,
            trainability: (LayerSelector::AllButLast, false),
            epochs: 10,
            early_stopping_patience: 1,
            reduce_lr: None,
        }
    }

    pub fn all_layers() -> Self {
        Self {
            phase: Phase::AllLayers,
            trainability: (LayerSelector::All, true),
            epochs: 50,
            early_stopping_patience: 10,
            reduce_lr: Some(PlateauPlan {
                monitor: LOSS,
                factor: 0.2,
                patience: 5,
                min_lr: 0.0001,
            }),
        }
    }
}

/// Staged fine-tuning of one model against a cutoff-selected manifest.
pub struct ModelTrainer<M: Model> {
    model: M,
    model_name: String,
    cutoff: String,
    input_size: (usize, usize),
    run_id: RunId,
    config: FacebmiConfig,
    seed: u64,
    held_out: Option<HeldOutSet>,
}

impl<M: Model> ModelTrainer<M> {
    pub fn new(model: M, model_name: &str, cutoff: &str, config: &FacebmiConfig) -> Result<Self> {
        config.validate()?;
        let input_size = spatial_input_size(&model)?;
        Ok(Self {
            model,
            model_name: model_name.to_string(),
            cutoff: cutoff.to_string(),
            input_size,
            run_id: RunId::new(model_name),
            config: config.clone(),
            seed: 0,
            held_out: None,
        })
    }

    /// Replace the generated run id.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Base seed for the per-epoch shuffle of the training data.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn cutoff(&self) -> &str {
        &self.cutoff
    }

    pub fn input_size(&self) -> (usize, usize) {
        self.input_size
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Phase 1: train only the last layer.
    pub fn train_top_layer(&mut self) -> Result<History> {
        self.run_phase(&PhasePlan::top_layer())
    }

    /// Phase 2: train every layer.
    pub fn train_all_layers(&mut self) -> Result<History> {
        self.run_phase(&PhasePlan::all_layers())
    }

    /// Batch source over `training_samples_<cutoff>_cutoff.csv`.
    pub fn train_source(&self) -> Result<BatchSource> {
        let manifest = self.config.training_manifest(&self.cutoff);
        tracing::info!(path = %manifest.display(), "Getting training data info");
        let records = read_manifest(&manifest)?;
        Ok(BatchSource::new(
            records,
            &self.config.cropped_imgs_dir,
            self.input_size,
            self.config.train_batch_size,
        )?
        .with_seed(self.seed))
    }

    fn held_out(&mut self) -> Result<HeldOutSet> {
        if self.held_out.is_none() {
            self.held_out = Some(eval::load_held_out(&self.config, self.input_size)?);
        }
        self.held_out
            .clone()
            .ok_or_else(|| MlError::evaluation("held-out set unavailable"))
    }

    fn check_split(&self, source: &BatchSource, held_out: &HeldOutSet) -> Result<()> {
        let overlap = eval::check_disjoint(source.records(), &held_out.records);
        if overlap.is_empty() {
            return Ok(());
        }
        if self.config.strict_split {
            return Err(MlError::dataset(format!(
                "{} training images are also in the held-out set (first: {})",
                overlap.len(),
                overlap[0]
            )));
        }
        tracing::warn!(
            overlapping = overlap.len(),
            first = %overlap[0],
            "Training manifest overlaps the held-out set"
        );
        Ok(())
    }

    fn run_phase(&mut self, plan: &PhasePlan) -> Result<History> {
        tracing::info!(run = %self.run_id, phase = %plan.phase, "Training phase starting");

        let weights_path = self
            .run_id
            .weights_path(&self.config.weights_dir, plan.phase);
        let log_dir = self
            .run_id
            .log_dir(&self.config.log_dir, &self.config.log_group, plan.phase);

        let (selector, trainable) = &plan.trainability;
        self.model.set_trainable(selector, *trainable)?;
        let token = self.model.recompile(
            LOSS_FN,
            Optimizer::Adam {
                learning_rate: LEARNING_RATE,
            },
        );
        tracing::debug!(
            generation = token.generation,
            trainable_layers = token.trainable_count(),
            "Model recompiled"
        );

        let source = self.train_source()?;
        let held_out = self.held_out()?;
        self.check_split(&source, &held_out)?;

        let mut callbacks: Vec<Box<dyn TrainingCallback>> = vec![
            Box::new(MaeCallback::new(held_out)),
            Box::new(EarlyStopping::new(
                VAL_MAE,
                Mode::Min,
                plan.early_stopping_patience,
            )),
            Box::new(ModelCheckpoint::best_only(weights_path, VAL_MAE, Mode::Min)),
            Box::new(ScalarLogger::new(log_dir)),
        ];
        if let Some(p) = &plan.reduce_lr {
            callbacks.push(Box::new(ReduceLrOnPlateau::new(
                p.monitor, p.factor, p.patience, p.min_lr,
            )));
        }

        let manager = CheckpointManager::new(
            self.config.weights_dir.clone(),
            MAX_MANIFEST_CHECKPOINTS,
        );
        let mut fit = FitLoop::new(plan.epochs, VAL_MAE)
            .with_checkpoint_log(manager, &self.run_id.phase_label(plan.phase));
        let history = fit.run(&mut self.model, &token, &source, &mut callbacks)?;

        tracing::info!(
            run = %self.run_id,
            phase = %plan.phase,
            epochs = history.epochs_completed,
            best_epoch = ?history.best_epoch,
            best = ?history.best_value,
            stop = ?history.stop_reason,
            "Training phase finished"
        );
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_plans() {
        let top = PhasePlan::top_layer();
        assert_eq!(top.epochs, 10);
        assert_eq!(top.early_stopping_patience, 1);
        assert_eq!(top.trainability, (LayerSelector::AllButLast, false));
        assert!(top.reduce_lr.is_none());

        let all = PhasePlan::all_layers();
        assert_eq!(all.epochs, 50);
        assert_eq!(all.early_stopping_patience, 10);
        assert_eq!(all.trainability, (LayerSelector::All, true));
        let plateau = all.reduce_lr.unwrap();
        assert_eq!(plateau.monitor, LOSS);
        assert_eq!(plateau.factor, 0.2);
        assert_eq!(plateau.patience, 5);
        assert_eq!(plateau.min_lr, 0.0001);
    }
}
