//! Shared data contracts for paired-image samples and manifest rows.

pub mod manifest;
pub mod sample;

pub use manifest::{
    ManifestRow, COMMENT_COLUMN, IMAGE_PATH_COLUMN, INPUT_CROP_COLUMN, TARGET_CROP_COLUMN,
};
pub use sample::{CropRegions, DerivationStrategy, Rectangle, SampleDescriptor, ValidationError};
