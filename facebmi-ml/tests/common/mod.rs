//! Shared fixtures for integration tests: a scripted stub model and an
//! on-disk dataset laid out the way the trainer and evaluator expect.

#![allow(dead_code)]

use facebmi_ml::FacebmiConfig;
use facebmi_ml::data::{Batch, ImageBatch};
use facebmi_ml::model::{
    CompileTracker, CompiledState, Layer, LayerSelector, Loss, Model, Optimizer, select_layers,
};
use facebmi_ml::{MlError, Result};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const CUTOFF: &str = "q1";

/// A model whose losses and predictions follow a script.
pub struct StubModel {
    pub size: (usize, usize),
    pub layers: Vec<Layer>,
    pub tracker: CompileTracker,
    pub lr: Option<f64>,
    /// Loss returned by successive train steps; the last value repeats.
    pub losses: Vec<f64>,
    /// Value predicted for every image on successive predict calls; the
    /// last value repeats.
    pub predictions: Vec<f32>,
    pub steps: usize,
    predict_calls: Cell<usize>,
    last_predict_len: Cell<usize>,
}

impl StubModel {
    pub fn new(size: (usize, usize)) -> Self {
        Self {
            size,
            layers: vec![
                Layer::new("conv1"),
                Layer::new("conv2"),
                Layer::new("pool"),
                Layer::new("dense"),
            ],
            tracker: CompileTracker::default(),
            lr: None,
            losses: vec![1.0],
            predictions: vec![0.0],
            steps: 0,
            predict_calls: Cell::new(0),
            last_predict_len: Cell::new(0),
        }
    }

    pub fn with_predictions(mut self, predictions: Vec<f32>) -> Self {
        self.predictions = predictions;
        self
    }

    pub fn with_losses(mut self, losses: Vec<f64>) -> Self {
        self.losses = losses;
        self
    }

    pub fn trainable_flags(&self) -> Vec<bool> {
        self.layers.iter().map(|l| l.trainable).collect()
    }

    pub fn last_predict_len(&self) -> usize {
        self.last_predict_len.get()
    }
}

fn scripted<T: Copy>(script: &[T], index: usize) -> T {
    script[index.min(script.len() - 1)]
}

impl Model for StubModel {
    fn input_shape(&self) -> Vec<Option<usize>> {
        vec![None, Some(self.size.0), Some(self.size.1), Some(3)]
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn set_trainable(&mut self, selector: &LayerSelector, trainable: bool) -> Result<usize> {
        select_layers(&mut self.layers, selector, trainable)
    }

    fn recompile(&mut self, loss: Loss, optimizer: Optimizer) -> CompiledState {
        self.lr = Some(optimizer.learning_rate());
        self.tracker.compile(&self.layers, loss, optimizer)
    }

    fn train_step(&mut self, state: &CompiledState, batch: &Batch) -> Result<f64> {
        self.tracker.check(state)?;
        if batch.images.image_size() != self.size {
            return Err(MlError::model("wrong image size"));
        }
        let loss = scripted(&self.losses, self.steps);
        self.steps += 1;
        Ok(loss)
    }

    fn predict(&self, images: &ImageBatch) -> Result<Vec<f32>> {
        let call = self.predict_calls.get();
        self.predict_calls.set(call + 1);
        self.last_predict_len.set(images.len());
        Ok(vec![scripted(&self.predictions, call); images.len()])
    }

    fn learning_rate(&self) -> Option<f64> {
        self.lr
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> Result<()> {
        self.lr = Some(learning_rate);
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("steps={}", self.steps))?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(MlError::not_found(path.display().to_string()));
        }
        Ok(())
    }
}

/// A temporary dataset: training images, a training manifest for
/// [`CUTOFF`], and an info file whose tail lists held-out images.
pub struct Fixture {
    pub dir: TempDir,
    pub config: FacebmiConfig,
    pub held_out_labels: Vec<f32>,
}

impl Fixture {
    pub fn new(train: usize, held_out: usize, batch_size: usize, edge: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let images = root.join("cropped");
        std::fs::create_dir_all(&images).unwrap();

        let mut manifest = String::from(",name,bmi,gender\n");
        for i in 0..train {
            let name = format!("train_{i}.png");
            write_png(&images.join(&name), i as u8 * 20);
            manifest.push_str(&format!("{i},{name},{},Male\n", 20.0 + i as f32));
        }
        std::fs::write(
            root.join(format!("training_samples_{CUTOFF}_cutoff.csv")),
            manifest,
        )
        .unwrap();

        let mut info = String::from("index,bmi,gender,is_training,name\n");
        let mut held_out_labels = Vec::new();
        for i in 0..held_out {
            let name = format!("held_{i}.png");
            write_png(&images.join(&name), 200 - i as u8 * 10);
            let label = 18.0 + 3.0 * i as f32;
            held_out_labels.push(label);
            info.push_str(&format!("{i},{label},Female,False,{name}\n"));
        }
        let info_path = root.join("cropped_info.csv");
        std::fs::write(&info_path, info).unwrap();

        let config = FacebmiConfig {
            cropped_imgs_dir: images,
            cropped_imgs_info_file: info_path,
            manifest_dir: root.to_path_buf(),
            train_batch_size: batch_size,
            validation_size: held_out,
            default_img_width: edge,
            weights_dir: root.join("weights"),
            log_dir: root.join("logs"),
            ..FacebmiConfig::default()
        };

        Self {
            dir,
            config,
            held_out_labels,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

pub fn write_png(path: &Path, shade: u8) {
    image::RgbImage::from_pixel(6, 6, image::Rgb([shade, shade / 2, 255 - shade]))
        .save(path)
        .unwrap();
}
