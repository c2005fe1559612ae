//! Pipeline configuration: defaults, validation, TOML loading, env overrides.

use crate::derive::DeriveConfig;
use crate::transform::TransformStep;
use crate::types::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_SHUFFLE_WINDOW: usize = 1000;
pub const DEFAULT_PREFETCH_DEPTH: usize = 2;
pub const DEFAULT_SKIP_RATIO: f64 = 0.1;
pub const DEFAULT_LOG_EVERY_BATCHES: usize = 100;
pub const DEFAULT_VALUE_RANGE: (f32, f32) = (0.0, 1.0);

/// What to do with the trailing batch when fewer than `batch_size` remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialBatchPolicy {
    #[default]
    Keep,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Log, count, and move on; fatal once the skip ratio is exceeded.
    #[default]
    Skip,
    /// First failing sample ends the epoch.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub shuffle_window_size: usize,
    pub prefetch_depth: usize,
    pub parallelism: usize,
    pub skip_ratio_threshold: f64,
    pub partial_batch: PartialBatchPolicy,
    pub skip_policy: SkipPolicy,
    pub seed: u64,
    /// Inclusive bounds every delivered value must satisfy after the
    /// transform chain. TOML: `value_range = [0.0, 1.0]`.
    pub value_range: (f32, f32),
    /// Per-read wall-clock bound, in seconds.
    pub sample_timeout_secs: Option<f64>,
    pub teardown_timeout_secs: f64,
    /// `None` disables periodic progress logs.
    pub log_every_batches: Option<usize>,
    /// Append one JSON line per delivered batch.
    pub trace_path: Option<PathBuf>,
    pub derive: DeriveConfig,
    #[serde(rename = "transform")]
    pub transforms: Vec<TransformStep>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            shuffle_window_size: DEFAULT_SHUFFLE_WINDOW,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            parallelism: num_cpus::get().max(1),
            skip_ratio_threshold: DEFAULT_SKIP_RATIO,
            partial_batch: PartialBatchPolicy::Keep,
            skip_policy: SkipPolicy::Skip,
            seed: 0,
            value_range: DEFAULT_VALUE_RANGE,
            sample_timeout_secs: None,
            teardown_timeout_secs: 5.0,
            log_every_batches: Some(DEFAULT_LOG_EVERY_BATCHES),
            trace_path: None,
            derive: DeriveConfig::default(),
            transforms: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, msg: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, msg })
        };
        if self.batch_size == 0 {
            return invalid("batch_size", "must be > 0".into());
        }
        if self.shuffle_window_size < self.batch_size {
            return invalid(
                "shuffle_window_size",
                format!(
                    "({}) must be >= batch_size ({})",
                    self.shuffle_window_size, self.batch_size
                ),
            );
        }
        if self.prefetch_depth == 0 {
            return invalid("prefetch_depth", "must be >= 1".into());
        }
        if self.parallelism == 0 {
            return invalid("parallelism", "must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&self.skip_ratio_threshold) {
            return invalid(
                "skip_ratio_threshold",
                format!("must be within [0, 1], got {}", self.skip_ratio_threshold),
            );
        }
        let (low, high) = self.value_range;
        if !(low.is_finite() && high.is_finite() && low < high) {
            return invalid(
                "value_range",
                format!("must be finite with low < high, got [{low}, {high}]"),
            );
        }
        if let Some(secs) = self.sample_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid("sample_timeout_secs", format!("must be > 0, got {secs}"));
            }
        }
        if !(self.teardown_timeout_secs.is_finite() && self.teardown_timeout_secs >= 0.0) {
            return invalid(
                "teardown_timeout_secs",
                format!("must be >= 0, got {}", self.teardown_timeout_secs),
            );
        }
        if let Some((w, h)) = self.derive.output_size {
            if w == 0 || h == 0 {
                return invalid("derive.output_size", format!("must be non-zero, got {w}x{h}"));
            }
        }
        Ok(())
    }

    pub fn sample_timeout(&self) -> Option<Duration> {
        self.sample_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.teardown_timeout_secs.max(0.0))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let cfg: PipelineConfig = toml::from_str(text).map_err(|source| ConfigError::Toml {
            path: origin.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `PAIR_DATASET_*` overrides. Unparsable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            let raw = std::env::var(key).ok()?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable override");
                    None
                }
            }
        }
        if let Some(v) = parse("PAIR_DATASET_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = parse("PAIR_DATASET_PREFETCH") {
            self.prefetch_depth = v;
        }
        if let Some(v) = parse("PAIR_DATASET_PARALLELISM") {
            self.parallelism = v;
        }
        if let Some(v) = parse("PAIR_DATASET_SKIP_RATIO") {
            self.skip_ratio_threshold = v;
        }
        if let Some(path) = std::env::var("PAIR_DATASET_TRACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            self.trace_path = Some(PathBuf::from(path));
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    cfg: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.cfg.batch_size = n;
        self
    }

    pub fn shuffle_window_size(mut self, n: usize) -> Self {
        self.cfg.shuffle_window_size = n;
        self
    }

    pub fn prefetch_depth(mut self, n: usize) -> Self {
        self.cfg.prefetch_depth = n;
        self
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.cfg.parallelism = n;
        self
    }

    pub fn skip_ratio_threshold(mut self, ratio: f64) -> Self {
        self.cfg.skip_ratio_threshold = ratio;
        self
    }

    pub fn partial_batch(mut self, policy: PartialBatchPolicy) -> Self {
        self.cfg.partial_batch = policy;
        self
    }

    pub fn skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.cfg.skip_policy = policy;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.cfg.seed = seed;
        self
    }

    pub fn value_range(mut self, low: f32, high: f32) -> Self {
        self.cfg.value_range = (low, high);
        self
    }

    pub fn sample_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cfg.sample_timeout_secs = timeout.map(|d| d.as_secs_f64());
        self
    }

    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.teardown_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn log_every_batches(mut self, every: Option<usize>) -> Self {
        self.cfg.log_every_batches = every.filter(|v| *v > 0);
        self
    }

    pub fn trace_path(mut self, path: Option<PathBuf>) -> Self {
        self.cfg.trace_path = path;
        self
    }

    pub fn derive(mut self, derive: DeriveConfig) -> Self {
        self.cfg.derive = derive;
        self
    }

    pub fn transform(mut self, step: TransformStep) -> Self {
        self.cfg.transforms.push(step);
        self
    }

    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
