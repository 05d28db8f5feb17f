//! Image decoding and in-memory image batches.
//!
//! Pixels are stored as RGB f32 values in `[0, 1]`, HWC order.

use crate::error::{MlError, Result};
use image::imageops::FilterType;
use std::path::Path;

pub const CHANNELS: usize = 3;

/// A single decoded and resized image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// Build a tensor filled with one value; mostly useful for tests and probes.
    pub fn filled(height: usize, width: usize, value: f32) -> Self {
        Self {
            height,
            width,
            data: vec![value; height * width * CHANNELS],
        }
    }
}

/// Decode an image from disk and resize it exactly to `(height, width)`.
pub fn load_image(path: &Path, size: (usize, usize)) -> Result<ImageTensor> {
    if !path.exists() {
        return Err(MlError::not_found(format!("image {}", path.display())));
    }
    let (height, width) = size;
    let img = image::open(path)?;
    let resized = img.resize_exact(width as u32, height as u32, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut data = Vec::with_capacity(height * width * CHANNELS);
    for pixel in rgb.pixels() {
        data.push(pixel[0] as f32 / 255.0);
        data.push(pixel[1] as f32 / 255.0);
        data.push(pixel[2] as f32 / 255.0);
    }

    Ok(ImageTensor {
        height,
        width,
        data,
    })
}

/// A stack of equally sized images held in one contiguous buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageBatch {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(height: usize, width: usize, images: usize) -> Self {
        Self {
            height,
            width,
            data: Vec::with_capacity(images * height * width * CHANNELS),
        }
    }

    /// Append an image; its size must match the batch.
    pub fn push(&mut self, image: &ImageTensor) -> Result<()> {
        if image.height != self.height || image.width != self.width {
            return Err(MlError::invalid_input(format!(
                "image is {}x{}, batch expects {}x{}",
                image.height, image.width, self.height, self.width
            )));
        }
        self.data.extend_from_slice(&image.data);
        Ok(())
    }

    pub fn image_len(&self) -> usize {
        self.height * self.width * CHANNELS
    }

    pub fn len(&self) -> usize {
        match self.image_len() {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(height, width)` of every image in the batch.
    pub fn image_size(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Pixels of the image at `index`, or `None` past the end of the batch.
    pub fn image(&self, index: usize) -> Option<&[f32]> {
        if index >= self.len() {
            return None;
        }
        let n = self.image_len();
        self.data.get(index * n..(index + 1) * n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.image_len().max(1))
    }
}
