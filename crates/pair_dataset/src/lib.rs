//! Paired-image training data pipeline.
//!
//! This crate provides:
//! - Manifest resolution from record sources or directory walks
//! - Pair derivation by splitting a composite image or cropping two regions
//! - Composable per-pair transform chains
//! - A streaming engine with windowed shuffle, batching and prefetch
//! - Order-preserving parallel map and timeout-guarded execution

// Module declarations
pub mod batch;
pub mod config;
pub mod derive;
pub mod guard;
pub mod manifest;
pub mod parallel;
pub mod shuffle;
pub mod stream;
pub mod transform;
pub mod types;

// Re-export public API
pub use batch::BatchAssembler;
pub use config::{PartialBatchPolicy, PipelineConfig, PipelineConfigBuilder, SkipPolicy};
pub use derive::{
    split_spans, ColorMode, DeriveConfig, FsImageReader, GuardedReader, ImageReader, OddColumn,
    PairDeriver, SplitAxis, TargetSide,
};
pub use guard::{run_with_timeout, Guard};
pub use manifest::{
    resolve_query, resolve_root, resolve_roots, CsvManifestSource, ManifestQuery, ManifestSource,
    StaticManifestSource,
};
pub use parallel::{
    map_parallel, map_parallel_with_progress, progress_bar, try_map_parallel, ItemError,
    WorkerFault,
};
pub use shuffle::ShuffleWindow;
pub use stream::{EpochIter, PairPipeline};
pub use transform::{
    check_value_range, compose, Composed, FnPairTransform, FnTransform, PairTransform, Side, Stage, Transform,
    TransformChain, TransformRegistry, TransformStep,
};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::BurnBatch;

pub use data_contracts::{CropRegions, DerivationStrategy, Rectangle, SampleDescriptor};
