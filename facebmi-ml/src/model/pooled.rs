//! `PooledRegressor`: a small reference model.
//!
//! Layers, in order:
//! - `grid_pool`: per-channel average pooling over a `grid x grid` layout
//!   (no parameters);
//! - `backbone`: dense layer with ReLU;
//! - `head`: dense layer producing the scalar prediction.
//!
//! Trained with Adam on mean absolute error. Weights are stored as JSON.

use super::{CompileTracker, CompiledState, Layer, LayerSelector, Loss, Model, Optimizer, select_layers};
use crate::data::image::CHANNELS;
use crate::data::{Batch, ImageBatch};
use crate::error::{MlError, Result};
use crate::persist;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

const WEIGHTS_FORMAT: &str = "facebmi.pooled.v1";

const BETA_1: f32 = 0.9;
const BETA_2: f32 = 0.999;
const EPSILON: f32 = 1e-7;

/// Shape and initialisation of a [`PooledRegressor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledConfig {
    pub grid: usize,
    pub hidden: usize,
    pub seed: u64,
    /// Initial head bias, i.e. the prediction of an untrained model.
    pub output_bias: f32,
}

impl Default for PooledConfig {
    fn default() -> Self {
        Self {
            grid: 4,
            hidden: 32,
            seed: 42,
            output_bias: 25.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dense {
    inputs: usize,
    outputs: usize,
    /// Row-major `[outputs][inputs]`.
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl Dense {
    fn glorot(inputs: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            bias: vec![0.0; outputs],
        }
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        (0..self.outputs)
            .map(|o| {
                let row = &self.weights[o * self.inputs..(o + 1) * self.inputs];
                row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + self.bias[o]
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Adam {
    m: Vec<f32>,
    v: Vec<f32>,
    step: i32,
}

impl Adam {
    fn apply(&mut self, params: &mut [f32], grads: &[f32], lr: f32) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }
        self.step += 1;
        let lr_t = lr * (1.0 - BETA_2.powi(self.step)).sqrt() / (1.0 - BETA_1.powi(self.step));
        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = BETA_1 * self.m[i] + (1.0 - BETA_1) * g;
            self.v[i] = BETA_2 * self.v[i] + (1.0 - BETA_2) * g * g;
            params[i] -= lr_t * self.m[i] / (self.v[i].sqrt() + EPSILON);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DenseOptim {
    weights: Adam,
    bias: Adam,
}

#[derive(Serialize, Deserialize)]
struct WeightsFile {
    format: String,
    input_size: (usize, usize),
    grid: usize,
    hidden: usize,
    backbone: Dense,
    head: Dense,
}

/// Reference regression model over grid-pooled RGB features.
#[derive(Debug, Clone)]
pub struct PooledRegressor {
    input_size: (usize, usize),
    grid: usize,
    layers: Vec<Layer>,
    backbone: Dense,
    head: Dense,
    optim: [DenseOptim; 2],
    learning_rate: Option<f64>,
    tracker: CompileTracker,
}

impl PooledRegressor {
    pub fn new(input_size: (usize, usize), config: &PooledConfig) -> Result<Self> {
        let (h, w) = input_size;
        if config.grid == 0 || config.hidden == 0 {
            return Err(MlError::model("grid and hidden width must be at least 1"));
        }
        if h < config.grid || w < config.grid {
            return Err(MlError::model(format!(
                "input {h}x{w} is smaller than the {g}x{g} pooling grid",
                g = config.grid
            )));
        }

        let features = config.grid * config.grid * CHANNELS;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let backbone = Dense::glorot(features, config.hidden, &mut rng);
        let mut head = Dense::glorot(config.hidden, 1, &mut rng);
        head.bias[0] = config.output_bias;

        Ok(Self {
            input_size,
            grid: config.grid,
            layers: vec![
                Layer::new("grid_pool"),
                Layer::new("backbone"),
                Layer::new("head"),
            ],
            backbone,
            head,
            optim: Default::default(),
            learning_rate: None,
            tracker: CompileTracker::default(),
        })
    }

    fn check_size(&self, images: &ImageBatch) -> Result<()> {
        if images.image_size() != self.input_size {
            let (h, w) = images.image_size();
            return Err(MlError::model(format!(
                "images are {h}x{w}, model expects {}x{}",
                self.input_size.0, self.input_size.1
            )));
        }
        Ok(())
    }

    fn pool(&self, image: &[f32]) -> Vec<f32> {
        let (h, w) = self.input_size;
        let g = self.grid;
        let mut out = vec![0.0; g * g * CHANNELS];
        for gy in 0..g {
            let (y0, y1) = (gy * h / g, (gy + 1) * h / g);
            for gx in 0..g {
                let (x0, x1) = (gx * w / g, (gx + 1) * w / g);
                let cell = (gy * g + gx) * CHANNELS;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let p = (y * w + x) * CHANNELS;
                        for c in 0..CHANNELS {
                            out[cell + c] += image[p + c];
                        }
                    }
                }
                let area = ((y1 - y0) * (x1 - x0)) as f32;
                for c in 0..CHANNELS {
                    out[cell + c] /= area;
                }
            }
        }
        out
    }

    fn forward(&self, image: &[f32]) -> (Vec<f32>, Vec<f32>, Vec<f32>, f32) {
        let x = self.pool(image);
        let z = self.backbone.forward(&x);
        let a: Vec<f32> = z.iter().map(|v| v.max(0.0)).collect();
        let y = self.head.forward(&a)[0];
        (x, z, a, y)
    }
}

impl Model for PooledRegressor {
    fn input_shape(&self) -> Vec<Option<usize>> {
        vec![
            None,
            Some(self.input_size.0),
            Some(self.input_size.1),
            Some(CHANNELS),
        ]
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn set_trainable(&mut self, selector: &LayerSelector, trainable: bool) -> Result<usize> {
        select_layers(&mut self.layers, selector, trainable)
    }

    fn recompile(&mut self, loss: Loss, optimizer: Optimizer) -> CompiledState {
        // A recompile starts a fresh optimizer.
        self.optim = Default::default();
        self.learning_rate = Some(optimizer.learning_rate());
        self.tracker.compile(&self.layers, loss, optimizer)
    }

    fn train_step(&mut self, state: &CompiledState, batch: &Batch) -> Result<f64> {
        self.tracker.check(state)?;
        self.check_size(&batch.images)?;
        if batch.is_empty() {
            return Err(MlError::training("empty batch"));
        }
        let lr = self.learning_rate.unwrap_or(state.optimizer.learning_rate()) as f32;
        let train_backbone = state.trainable.get(1).copied().unwrap_or(false);
        let train_head = state.trainable.get(2).copied().unwrap_or(false);

        let n = batch.len() as f32;
        let hidden = self.backbone.outputs;
        let features = self.backbone.inputs;
        let mut gw1 = vec![0.0; self.backbone.weights.len()];
        let mut gb1 = vec![0.0; hidden];
        let mut gw2 = vec![0.0; hidden];
        let mut gb2 = [0.0];
        let mut loss = 0.0f64;

        for (image, &target) in batch.images.iter().zip(&batch.labels) {
            let (x, z, a, y) = self.forward(image);
            let diff = y - target;
            loss += diff.abs() as f64;
            let g = if diff > 0.0 {
                1.0 / n
            } else if diff < 0.0 {
                -1.0 / n
            } else {
                0.0
            };

            for j in 0..hidden {
                gw2[j] += g * a[j];
            }
            gb2[0] += g;

            if train_backbone {
                for j in 0..hidden {
                    if z[j] <= 0.0 {
                        continue;
                    }
                    let dz = g * self.head.weights[j];
                    gb1[j] += dz;
                    let row = &mut gw1[j * features..(j + 1) * features];
                    for (slot, v) in row.iter_mut().zip(&x) {
                        *slot += dz * v;
                    }
                }
            }
        }

        if train_backbone {
            let [backbone_optim, _] = &mut self.optim;
            backbone_optim.weights.apply(&mut self.backbone.weights, &gw1, lr);
            backbone_optim.bias.apply(&mut self.backbone.bias, &gb1, lr);
        }
        if train_head {
            let [_, head_optim] = &mut self.optim;
            head_optim.weights.apply(&mut self.head.weights, &gw2, lr);
            head_optim.bias.apply(&mut self.head.bias, &gb2, lr);
        }

        Ok(loss / batch.len() as f64)
    }

    fn predict(&self, images: &ImageBatch) -> Result<Vec<f32>> {
        self.check_size(images)?;
        Ok(images.iter().map(|img| self.forward(img).3).collect())
    }

    fn learning_rate(&self) -> Option<f64> {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        if self.learning_rate.is_none() {
            return Err(MlError::training("cannot set learning rate before compiling"));
        }
        self.learning_rate = Some(learning_rate);
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        let file = WeightsFile {
            format: WEIGHTS_FORMAT.to_string(),
            input_size: self.input_size,
            grid: self.grid,
            hidden: self.backbone.outputs,
            backbone: self.backbone.clone(),
            head: self.head.clone(),
        };
        persist::atomic_write_json(path, &file)?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        let file: WeightsFile = persist::load_json(path)?
            .ok_or_else(|| MlError::not_found(format!("weights {}", path.display())))?;
        if file.format != WEIGHTS_FORMAT {
            return Err(MlError::model(format!(
                "unsupported weights format '{}'",
                file.format
            )));
        }
        if file.input_size != self.input_size
            || file.grid != self.grid
            || file.hidden != self.backbone.outputs
        {
            return Err(MlError::model(format!(
                "weights in {} do not match the model architecture",
                path.display()
            )));
        }
        self.backbone = file.backbone;
        self.head = file.head;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ImageTensor;

    fn small() -> PooledRegressor {
        let config = PooledConfig {
            grid: 2,
            hidden: 4,
            seed: 7,
            output_bias: 0.0,
        };
        PooledRegressor::new((4, 4), &config).unwrap()
    }

    fn batch(values: &[(f32, f32)]) -> Batch {
        let mut images = ImageBatch::new(4, 4);
        let mut labels = Vec::new();
        for (pixel, label) in values {
            images.push(&ImageTensor::filled(4, 4, *pixel)).unwrap();
            labels.push(*label);
        }
        Batch { images, labels }
    }

    #[test]
    fn test_input_shape_is_keras_style() {
        assert_eq!(small().input_shape(), vec![None, Some(4), Some(4), Some(3)]);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = small();
        let token = model.recompile(Loss::MeanAbsoluteError, Optimizer::Adam { learning_rate: 0.05 });
        let data = batch(&[(0.1, 2.0), (0.9, 4.0)]);
        let first = model.train_step(&token, &data).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = model.train_step(&token, &data).unwrap();
        }
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_frozen_backbone_is_untouched() {
        let mut model = small();
        model.set_trainable(&LayerSelector::AllButLast, false).unwrap();
        let token = model.recompile(Loss::MeanAbsoluteError, Optimizer::Adam { learning_rate: 0.01 });
        let before = model.backbone.clone();
        let head_before = model.head.clone();
        model.train_step(&token, &batch(&[(0.5, 3.0)])).unwrap();
        assert_eq!(model.backbone, before);
        assert_ne!(model.head, head_before);
    }

    #[test]
    fn test_stale_token_rejected() {
        let mut model = small();
        let adam = Optimizer::Adam { learning_rate: 0.01 };
        let old = model.recompile(Loss::MeanAbsoluteError, adam);
        model.recompile(Loss::MeanAbsoluteError, adam);
        let err = model.train_step(&old, &batch(&[(0.5, 3.0)])).unwrap_err();
        assert!(matches!(err, MlError::Training(_)));
    }

    #[test]
    fn test_predict_rejects_wrong_size() {
        let model = small();
        let mut images = ImageBatch::new(8, 8);
        images.push(&ImageTensor::filled(8, 8, 0.0)).unwrap();
        assert!(matches!(model.predict(&images), Err(MlError::Model(_))));
    }

    #[test]
    fn test_weights_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w").join("run_top_layer.h5");
        let mut trained = small();
        let token = trained.recompile(Loss::MeanAbsoluteError, Optimizer::Adam { learning_rate: 0.05 });
        trained.train_step(&token, &batch(&[(0.3, 5.0)])).unwrap();
        trained.save_weights(&path).unwrap();

        let mut fresh = small();
        fresh.load_weights(&path).unwrap();
        let probe = batch(&[(0.3, 0.0)]).images;
        assert_eq!(trained.predict(&probe).unwrap(), fresh.predict(&probe).unwrap());
    }

    #[test]
    fn test_grid_larger_than_input() {
        let config = PooledConfig {
            grid: 8,
            ..PooledConfig::default()
        };
        assert!(PooledRegressor::new((4, 4), &config).is_err());
    }
}
