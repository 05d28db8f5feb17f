//! The model handle seam.
//!
//! A model is an owned, mutable resource. Phase transitions are explicit:
//! callers flip layer trainability with [`Model::set_trainable`] and then
//! call [`Model::recompile`], which returns a [`CompiledState`] token. Train
//! steps must present the latest token; the trainability mask captured in it
//! decides which layers are updated.

pub mod pooled;

pub use pooled::{PooledConfig, PooledRegressor};

use crate::data::{Batch, ImageBatch};
use crate::error::{MlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A named layer and its trainability flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub trainable: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trainable: true,
        }
    }
}

/// Which layers a trainability change applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelector {
    All,
    AllButLast,
    Last,
    Named(String),
}

/// Apply a selector to a layer list. Returns how many layers matched.
pub fn select_layers(layers: &mut [Layer], selector: &LayerSelector, trainable: bool) -> Result<usize> {
    let count = layers.len();
    let mut matched = 0;
    for (i, layer) in layers.iter_mut().enumerate() {
        let hit = match selector {
            LayerSelector::All => true,
            LayerSelector::AllButLast => i + 1 < count,
            LayerSelector::Last => i + 1 == count,
            LayerSelector::Named(name) => &layer.name == name,
        };
        if hit {
            layer.trainable = trainable;
            matched += 1;
        }
    }
    if let LayerSelector::Named(name) = selector {
        if matched == 0 {
            return Err(MlError::model(format!("no layer named '{name}'")));
        }
    }
    Ok(matched)
}

/// Loss functions a model can be compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    MeanAbsoluteError,
}

/// Optimizers a model can be compiled with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Optimizer {
    Adam { learning_rate: f64 },
}

impl Optimizer {
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam { learning_rate } => *learning_rate,
        }
    }
}

/// Token returned by a recompile.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledState {
    pub generation: u64,
    pub loss: Loss,
    pub optimizer: Optimizer,
    /// Trainability of each layer at compile time.
    pub trainable: Vec<bool>,
}

impl CompiledState {
    pub fn trainable_count(&self) -> usize {
        self.trainable.iter().filter(|t| **t).count()
    }
}

/// Issues compile tokens and checks that train steps use the latest one.
#[derive(Debug, Clone, Default)]
pub struct CompileTracker {
    current: Option<CompiledState>,
}

impl CompileTracker {
    pub fn compile(&mut self, layers: &[Layer], loss: Loss, optimizer: Optimizer) -> CompiledState {
        let generation = self.current.as_ref().map_or(1, |c| c.generation + 1);
        let state = CompiledState {
            generation,
            loss,
            optimizer,
            trainable: layers.iter().map(|l| l.trainable).collect(),
        };
        self.current = Some(state.clone());
        state
    }

    pub fn current(&self) -> Option<&CompiledState> {
        self.current.as_ref()
    }

    pub fn check(&self, token: &CompiledState) -> Result<()> {
        match &self.current {
            None => Err(MlError::training("model has not been compiled")),
            Some(c) if c.generation != token.generation => Err(MlError::training(format!(
                "stale compile token (generation {}, current {})",
                token.generation, c.generation
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// A trainable regression model.
pub trait Model {
    /// Declared input shape, `[batch, height, width, channels]`; `None` marks
    /// an unconstrained dimension.
    fn input_shape(&self) -> Vec<Option<usize>>;

    fn layers(&self) -> &[Layer];

    fn set_trainable(&mut self, selector: &LayerSelector, trainable: bool) -> Result<usize>;

    fn recompile(&mut self, loss: Loss, optimizer: Optimizer) -> CompiledState;

    /// Run one optimisation step and return the mean batch loss.
    fn train_step(&mut self, state: &CompiledState, batch: &Batch) -> Result<f64>;

    fn predict(&self, images: &ImageBatch) -> Result<Vec<f32>>;

    fn learning_rate(&self) -> Option<f64>;

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()>;

    fn save_weights(&self, path: &Path) -> Result<()>;

    fn load_weights(&mut self, path: &Path) -> Result<()>;
}

/// Spatial input size `(height, width)`, dropping batch and channel dims.
pub fn spatial_input_size(model: &dyn Model) -> Result<(usize, usize)> {
    let shape = model.input_shape();
    if shape.len() != 4 {
        return Err(MlError::model(format!(
            "expected a rank-4 input shape, got rank {}",
            shape.len()
        )));
    }
    match (shape[1], shape[2]) {
        (Some(h), Some(w)) if h > 0 && w > 0 => Ok((h, w)),
        _ => Err(MlError::model(format!(
            "input shape {shape:?} has no fixed spatial size"
        ))),
    }
}
