//! Data engineering: CSV manifests, image decoding, and lazy batch sources.

pub mod image;
pub mod loader;
pub mod manifest;

pub use self::image::{ImageBatch, ImageTensor, load_image};
pub use loader::{Batch, BatchSource, EpochIter};
pub use manifest::{ManifestRecord, read_manifest};
