//! Training infrastructure: run ids, metrics, callbacks, checkpoints, the
//! fit loop, and the two-phase trainer.

pub mod callbacks;
pub mod checkpoint;
pub mod fit;
pub mod metrics;
pub mod run_id;
pub mod trainer;

pub use callbacks::{CallbackAction, TrainingCallback};
pub use checkpoint::CheckpointManager;
pub use fit::{FitLoop, FitState};
pub use metrics::{EpochLogs, History, StopReason};
pub use run_id::{Phase, RunId};
pub use trainer::{ModelTrainer, PhasePlan};
