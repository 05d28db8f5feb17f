//! Lazy, restartable batch source over a manifest and an image directory.
//!
//! Images are decoded only while an epoch is iterated. Each epoch visits the
//! samples in a seeded shuffled order and drops the trailing partial batch,
//! so an epoch yields exactly `batches_per_epoch()` batches.

use super::image::{ImageBatch, load_image};
use super::manifest::ManifestRecord;
use crate::error::{MlError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

/// One training batch: images plus their regression targets.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: ImageBatch,
    pub labels: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Batch source for a training run.
#[derive(Debug, Clone)]
pub struct BatchSource {
    records: Vec<ManifestRecord>,
    image_dir: PathBuf,
    target_size: (usize, usize),
    batch_size: usize,
    seed: u64,
}

impl BatchSource {
    /// Create a source. Rows whose image file is absent are dropped with a
    /// warning; a missing image directory is fatal.
    pub fn new(
        records: Vec<ManifestRecord>,
        image_dir: &Path,
        target_size: (usize, usize),
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlError::invalid_input("batch size must be at least 1"));
        }
        if !image_dir.is_dir() {
            return Err(MlError::not_found(format!(
                "image directory {}",
                image_dir.display()
            )));
        }

        let total = records.len();
        let records: Vec<ManifestRecord> = records
            .into_iter()
            .filter(|r| image_dir.join(&r.name).is_file())
            .collect();
        if records.len() < total {
            tracing::warn!(
                dropped = total - records.len(),
                kept = records.len(),
                dir = %image_dir.display(),
                "Manifest rows reference missing images"
            );
        }

        Ok(Self {
            records,
            image_dir: image_dir.to_path_buf(),
            target_size,
            batch_size,
            seed: 0,
        })
    }

    /// Base seed for the per-epoch shuffle.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn target_size(&self) -> (usize, usize) {
        self.target_size
    }

    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.records.len() / self.batch_size
    }

    /// Start iterating one epoch. Calling this again with the same index
    /// replays the same order.
    pub fn epoch(&self, epoch: usize) -> EpochIter<'_> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        EpochIter {
            source: self,
            order,
            next_batch: 0,
            total: self.batches_per_epoch(),
        }
    }

    fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let (h, w) = self.target_size;
        let mut images = ImageBatch::with_capacity(h, w, indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let record = &self.records[i];
            let tensor = load_image(&self.image_dir.join(&record.name), self.target_size)?;
            images.push(&tensor)?;
            labels.push(record.bmi);
        }
        Ok(Batch { images, labels })
    }
}

/// Iterator over the batches of one epoch.
pub struct EpochIter<'a> {
    source: &'a BatchSource,
    order: Vec<usize>,
    next_batch: usize,
    total: usize,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_batch >= self.total {
            return None;
        }
        let bs = self.source.batch_size;
        let start = self.next_batch * bs;
        self.next_batch += 1;
        Some(self.source.load_batch(&self.order[start..start + bs]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next_batch;
        (left, Some(left))
    }
}

impl ExactSizeIterator for EpochIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_images(dir: &Path, n: usize) -> Vec<ManifestRecord> {
        (0..n)
            .map(|i| {
                let name = format!("img_{i}.png");
                image::RgbImage::from_pixel(4, 4, image::Rgb([i as u8, 0, 0]))
                    .save(dir.join(&name))
                    .unwrap();
                ManifestRecord {
                    name,
                    bmi: 20.0 + i as f32,
                }
            })
            .collect()
    }

    #[test]
    fn test_batches_per_epoch_is_floor() {
        let dir = tempfile::tempdir().unwrap();
        let records = write_images(dir.path(), 10);
        let source = BatchSource::new(records, dir.path(), (2, 2), 3).unwrap();
        assert_eq!(source.batches_per_epoch(), 3);

        let batches: Vec<Batch> = source.epoch(0).map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 3));
        assert_eq!(batches[0].images.image_size(), (2, 2));
    }

    #[test]
    fn test_epoch_is_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let records = write_images(dir.path(), 8);
        let source = BatchSource::new(records, dir.path(), (2, 2), 4)
            .unwrap()
            .with_seed(9);
        let first: Vec<Vec<f32>> = source.epoch(3).map(|b| b.unwrap().labels).collect();
        let again: Vec<Vec<f32>> = source.epoch(3).map(|b| b.unwrap().labels).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_missing_images_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = write_images(dir.path(), 4);
        records.push(ManifestRecord {
            name: "ghost.png".into(),
            bmi: 40.0,
        });
        let source = BatchSource::new(records, dir.path(), (2, 2), 2).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.batches_per_epoch(), 2);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err = BatchSource::new(Vec::new(), Path::new("/no/such/dir"), (2, 2), 2).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }
}
