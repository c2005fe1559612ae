//! Pair derivation: one source image in, one raw (input, target) pair out.

use crate::guard::run_with_timeout;
use crate::types::{DerivationError, GuardError, ImagePair, ImageTensor};
use data_contracts::{CropRegions, DerivationStrategy, Rectangle, SampleDescriptor};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Storage backend that yields decoded images.
pub trait ImageReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<DynamicImage, DerivationError>;
}

/// Local filesystem reader; the format is sniffed from the file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageReader;

impl ImageReader for FsImageReader {
    fn read(&self, path: &Path) -> Result<DynamicImage, DerivationError> {
        let bytes = fs::read(path).map_err(|e| DerivationError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        image::load_from_memory(&bytes).map_err(|e| DerivationError::Decode {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Bounds every read of the wrapped reader by a wall-clock timeout.
#[derive(Clone)]
pub struct GuardedReader {
    inner: Arc<dyn ImageReader>,
    timeout: Duration,
}

impl GuardedReader {
    pub fn new(inner: Arc<dyn ImageReader>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl ImageReader for GuardedReader {
    fn read(&self, path: &Path) -> Result<DynamicImage, DerivationError> {
        let inner = Arc::clone(&self.inner);
        let owned = path.to_path_buf();
        match run_with_timeout(move || inner.read(&owned), self.timeout) {
            Ok(res) => res,
            Err(GuardError::TimedOut(timeout)) => Err(DerivationError::Timeout {
                path: path.to_path_buf(),
                timeout,
            }),
            Err(e) => Err(DerivationError::ReaderFault {
                path: path.to_path_buf(),
                msg: e.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitAxis {
    /// Left/right halves.
    #[default]
    Width,
    /// Top/bottom halves.
    Height,
}

/// Which half of a split image is the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSide {
    /// Left (or top) half is the target, the other half the input.
    #[default]
    First,
    Second,
}

/// Owner of the middle column when an odd extent is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OddColumn {
    #[default]
    Input,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Rgb,
    Luma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeriveConfig {
    pub split_axis: SplitAxis,
    pub target_side: TargetSide,
    pub odd_column: OddColumn,
    /// Resize both halves to this (width, height) after splitting or cropping.
    pub output_size: Option<(u32, u32)>,
    pub color: ColorMode,
}

/// Offsets and lengths of (input, target) along the split axis.
pub fn split_spans(
    extent: u32,
    target_side: TargetSide,
    odd_column: OddColumn,
) -> Option<((u32, u32), (u32, u32))> {
    let half = extent / 2;
    if half == 0 {
        return None;
    }
    let first_is_target = target_side == TargetSide::First;
    let boundary_to_target = odd_column == OddColumn::Target;
    let first_takes_boundary = extent % 2 == 1 && boundary_to_target == first_is_target;
    let first_len = half + u32::from(first_takes_boundary);
    let first = (0, first_len);
    let second = (first_len, extent - first_len);
    if first_is_target {
        Some((second, first))
    } else {
        Some((first, second))
    }
}

pub struct PairDeriver {
    reader: Arc<dyn ImageReader>,
    cfg: DeriveConfig,
}

impl PairDeriver {
    pub fn new(cfg: DeriveConfig) -> Self {
        Self::with_reader(Arc::new(FsImageReader), cfg)
    }

    pub fn with_reader(reader: Arc<dyn ImageReader>, cfg: DeriveConfig) -> Self {
        Self { reader, cfg }
    }

    /// Wrap the current reader with a per-read timeout.
    pub fn guarded(self, timeout: Duration) -> Self {
        Self {
            reader: Arc::new(GuardedReader::new(self.reader, timeout)),
            cfg: self.cfg,
        }
    }

    pub fn config(&self) -> &DeriveConfig {
        &self.cfg
    }

    pub fn derive(&self, descriptor: &SampleDescriptor) -> Result<ImagePair, DerivationError> {
        let img = self.reader.read(&descriptor.source_path)?;
        let img = match self.cfg.color {
            ColorMode::Rgb => DynamicImage::ImageRgb8(img.to_rgb8()),
            ColorMode::Luma => DynamicImage::ImageLuma8(img.to_luma8()),
        };
        let (input, target) = match &descriptor.strategy {
            DerivationStrategy::Split => self.split(&img, descriptor)?,
            DerivationStrategy::Crop(regions) => crop_pair(&img, regions, descriptor)?,
        };
        Ok(ImagePair {
            input: self.to_tensor(input),
            target: self.to_tensor(target),
        })
    }

    fn split(
        &self,
        img: &DynamicImage,
        descriptor: &SampleDescriptor,
    ) -> Result<(DynamicImage, DynamicImage), DerivationError> {
        let (w, h) = (img.width(), img.height());
        let extent = match self.cfg.split_axis {
            SplitAxis::Width => w,
            SplitAxis::Height => h,
        };
        let (input, target) = split_spans(extent, self.cfg.target_side, self.cfg.odd_column)
            .ok_or_else(|| DerivationError::TooSmallToSplit {
                sample: descriptor.identity(),
                width: w,
                height: h,
            })?;
        let cut = |(start, len): (u32, u32)| match self.cfg.split_axis {
            SplitAxis::Width => img.crop_imm(start, 0, len, h),
            SplitAxis::Height => img.crop_imm(0, start, w, len),
        };
        Ok((cut(input), cut(target)))
    }

    fn to_tensor(&self, img: DynamicImage) -> ImageTensor {
        let img = match self.cfg.output_size {
            Some((w, h)) if (w, h) != (img.width(), img.height()) => {
                img.resize_exact(w, h, FilterType::Triangle)
            }
            _ => img,
        };
        match self.cfg.color {
            ColorMode::Rgb => ImageTensor::from_rgb8(&img.to_rgb8()),
            ColorMode::Luma => ImageTensor::from_luma8(&img.to_luma8()),
        }
    }
}

fn crop_pair(
    img: &DynamicImage,
    regions: &CropRegions,
    descriptor: &SampleDescriptor,
) -> Result<(DynamicImage, DynamicImage), DerivationError> {
    let crop = |rect: &Rectangle| -> Result<DynamicImage, DerivationError> {
        rect.check_bounds(img.width(), img.height())
            .map_err(|source| DerivationError::Region {
                sample: descriptor.identity(),
                source,
            })?;
        Ok(img.crop_imm(rect.top_left.0, rect.top_left.1, rect.width(), rect.height()))
    };
    Ok((crop(&regions.input)?, crop(&regions.target)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_extent_splits_evenly() {
        let (input, target) = split_spans(8, TargetSide::First, OddColumn::Input).unwrap();
        assert_eq!(target, (0, 4));
        assert_eq!(input, (4, 4));
    }

    #[test]
    fn odd_boundary_follows_configuration() {
        // target on the left, boundary column to the input (right) half
        let (input, target) = split_spans(9, TargetSide::First, OddColumn::Input).unwrap();
        assert_eq!(target, (0, 4));
        assert_eq!(input, (4, 5));

        let (input, target) = split_spans(9, TargetSide::First, OddColumn::Target).unwrap();
        assert_eq!(target, (0, 5));
        assert_eq!(input, (5, 4));

        let (input, target) = split_spans(9, TargetSide::Second, OddColumn::Input).unwrap();
        assert_eq!(input, (0, 5));
        assert_eq!(target, (5, 4));
    }

    #[test]
    fn single_column_cannot_split() {
        assert!(split_spans(1, TargetSide::First, OddColumn::Input).is_none());
        assert!(split_spans(0, TargetSide::First, OddColumn::Input).is_none());
    }
}
