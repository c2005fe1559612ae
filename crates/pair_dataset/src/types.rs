//! Core types, error definitions, and tensor containers for pair_dataset.

use data_contracts::ValidationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type ManifestResult<T> = Result<T, ManifestError>;
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest source unreachable at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest root does not exist: {0}")]
    RootMissing(PathBuf),
    #[error("malformed manifest {origin}: {msg}")]
    Malformed { origin: String, msg: String },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("walk failed under {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("invalid manifest query {query:?}: {msg}")]
    Query { query: String, msg: String },
}

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid crop region for {sample}: {source}")]
    Region {
        sample: String,
        #[source]
        source: ValidationError,
    },
    #[error("{sample} is too small to split ({width}x{height})")]
    TooSmallToSplit {
        sample: String,
        width: u32,
        height: u32,
    },
    #[error("reading {path} timed out after {timeout:?}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("reader fault on {path}: {msg}")]
    ReaderFault { path: PathBuf, msg: String },
}

impl DerivationError {
    pub fn kind(&self) -> &'static str {
        match self {
            DerivationError::Unreadable { .. } => "unreadable",
            DerivationError::Decode { .. } => "decode",
            DerivationError::Region {
                source: ValidationError::OutOfBounds { .. },
                ..
            } => "out_of_bounds",
            DerivationError::Region { .. } => "invalid_region",
            DerivationError::TooSmallToSplit { .. } => "too_small",
            DerivationError::Timeout { .. } => "timeout",
            DerivationError::ReaderFault { .. } => "reader_fault",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform {transform} failed on {sample}: {msg}")]
    Failed {
        sample: String,
        transform: String,
        msg: String,
    },
    #[error("input/target shapes diverge for {sample}: {input:?} vs {target:?}")]
    ShapeMismatch {
        sample: String,
        input: [usize; 3],
        target: [usize; 3],
    },
    #[error("{sample} {side} has value {value} outside [{low}, {high}]")]
    OutOfRange {
        sample: String,
        side: &'static str,
        value: f32,
        low: f32,
        high: f32,
    },
    #[error("unknown transform {0:?}")]
    Unknown(String),
    #[error("invalid parameters for {transform}: {msg}")]
    InvalidParams { transform: String, msg: String },
}

/// Failure of a single sample. Recoverable by skipping.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("processing {sample} panicked: {msg}")]
    Panicked { sample: String, msg: String },
}

impl SampleError {
    pub fn kind(&self) -> &'static str {
        match self {
            SampleError::Derivation(e) => e.kind(),
            SampleError::Transform(TransformError::ShapeMismatch { .. }) => "shape_mismatch",
            SampleError::Transform(TransformError::OutOfRange { .. }) => "out_of_range",
            SampleError::Transform(_) => "transform",
            SampleError::Panicked { .. } => "panic",
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("guarded operation panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn guard thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} {msg}")]
    Invalid { field: &'static str, msg: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Fatal, epoch-aborting failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("skip ratio {ratio:.3} exceeds threshold {threshold:.3} ({skipped} of {total} samples skipped)")]
    SkipRatioExceeded {
        skipped: usize,
        total: usize,
        ratio: f64,
        threshold: f64,
    },
    #[error("sample {sample} failed under the abort policy: {source}")]
    SampleAborted {
        sample: String,
        #[source]
        source: SampleError,
    },
    #[error("sample {sample} has shape {found:?} but the epoch shape is {expected:?}")]
    InconsistentShape {
        sample: String,
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("pipeline worker channel disconnected")]
    Disconnected,
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Image tensor in HWC layout, row-major, `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageTensor {
    pub fn new(data: Vec<f32>, height: usize, width: usize, channels: usize) -> Result<Self, String> {
        if data.len() != height * width * channels {
            return Err(format!(
                "buffer of {} values does not match shape [{height}, {width}, {channels}]",
                data.len()
            ));
        }
        Ok(Self {
            data,
            height,
            width,
            channels,
        })
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self {
            data: vec![0.0; height * width * channels],
            height,
            width,
            channels,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    #[inline]
    pub fn offset(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.width + x) * self.channels + c
    }

    pub fn get(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.offset(y, x, c)]
    }

    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().map(|&v| f(v)).collect(),
            ..*self
        }
    }

    /// 8-bit image → `[0, 1]` floats.
    pub fn from_rgb8(img: &image::RgbImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
            height: h as usize,
            width: w as usize,
            channels: 3,
        }
    }

    pub fn from_luma8(img: &image::GrayImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            data: img.as_raw().iter().map(|&v| v as f32 / 255.0).collect(),
            height: h as usize,
            width: w as usize,
            channels: 1,
        }
    }

    /// Back to an 8-bit image, clamping to `[0, 1]`. Supports 1, 3 and 4 channels.
    pub fn to_dynamic(&self) -> Option<image::DynamicImage> {
        let raw: Vec<u8> = self
            .data
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect();
        let (w, h) = (self.width as u32, self.height as u32);
        match self.channels {
            1 => image::GrayImage::from_raw(w, h, raw).map(image::DynamicImage::ImageLuma8),
            3 => image::RgbImage::from_raw(w, h, raw).map(image::DynamicImage::ImageRgb8),
            4 => image::RgbaImage::from_raw(w, h, raw).map(image::DynamicImage::ImageRgba8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePair {
    pub input: ImageTensor,
    pub target: ImageTensor,
}

/// Stacked batch. `inputs`/`targets` are `[N, H, W, C]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub targets: Vec<f32>,
    pub shape: [usize; 4],
    /// Sample identities in batch order.
    pub identities: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    pub fn sample_shape(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    /// Input tensor of the `i`-th sample.
    pub fn input(&self, i: usize) -> Option<&[f32]> {
        let stride = self.shape[1] * self.shape[2] * self.shape[3];
        self.inputs.get(i * stride..(i + 1) * stride)
    }

    pub fn target(&self, i: usize) -> Option<&[f32]> {
        let stride = self.shape[1] * self.shape[2] * self.shape[3];
        self.targets.get(i * stride..(i + 1) * stride)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochState {
    NotStarted,
    Running,
    Draining,
    Exhausted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub epoch: u64,
    /// Samples delivered to the consumer inside batches.
    pub samples_seen: usize,
    pub samples_skipped: usize,
    pub batches_delivered: usize,
    /// Mean time the consumer spent inside `next_batch` per delivered batch.
    pub mean_batch_latency: Duration,
}
