//! # facebmi-ml: staged fine-tuning for face-image BMI regression
//!
//! A trainer runs two sequential fine-tuning phases over a CSV-declared
//! dataset (top layer only, then every layer), each with its own early
//! stopping, best-only checkpointing, and scalar logging. An evaluator
//! scores a model on the tail of the cropped-image info file.
//!
//! The network itself sits behind the [`Model`] trait; [`PooledRegressor`]
//! is a small reference implementation.

pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod model;
pub mod persist;
pub mod training;

// Re-exports
pub use config::{FacebmiConfig, load_config};
pub use error::{MlError, Result};
pub use eval::test_model;
pub use model::{Model, PooledConfig, PooledRegressor};
pub use training::{History, ModelTrainer, Phase, RunId};
