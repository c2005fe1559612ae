use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use pair_dataset::{
    resolve_query, resolve_roots, CsvManifestSource, ManifestQuery, PipelineConfig,
    SampleDescriptor,
};
use tracing_subscriber::EnvFilter;

use crate::config::ToolConfig;

/// Where samples come from, shared by every pair binary.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// CSV manifest with an `image_path` column.
    #[arg(long, conflicts_with = "root")]
    pub manifest: Option<PathBuf>,
    /// Manifest filter, e.g. "is_calibration = 0 and comments = 2".
    #[arg(long, requires = "manifest")]
    pub query: Option<String>,
    /// Directory to walk instead of a manifest (repeatable).
    #[arg(long)]
    pub root: Vec<PathBuf>,
    /// File-name substring filter for directory walks (repeatable).
    #[arg(long)]
    pub ext: Vec<String>,
    /// Pipeline TOML; takes precedence over the tools config.
    #[arg(long)]
    pub pipeline: Option<PathBuf>,
}

impl SourceArgs {
    pub fn resolve(&self, tools: &ToolConfig) -> Result<Vec<SampleDescriptor>> {
        if let Some(manifest) = &self.manifest {
            let text = self.query.as_deref().unwrap_or(&tools.manifest_query);
            let query: ManifestQuery = text.parse().context("parse manifest query")?;
            return resolve_query(&CsvManifestSource::new(manifest), &query)
                .with_context(|| format!("resolve manifest {}", manifest.display()));
        }
        if self.root.is_empty() {
            bail!("pass --manifest <csv> or at least one --root <dir>");
        }
        let exts: Vec<&str> = if self.ext.is_empty() {
            tools.extension_filters()
        } else {
            self.ext.iter().map(String::as_str).collect()
        };
        resolve_roots(&self.root, &exts).context("walk sample roots")
    }

    /// Pipeline config from `--pipeline`, then the tools config, then
    /// defaults; `PAIR_DATASET_*` overrides apply last.
    pub fn pipeline_config(&self, tools: &ToolConfig) -> Result<PipelineConfig> {
        let cfg = match self.pipeline.as_ref().or(tools.pipeline_config.as_ref()) {
            Some(path) => PipelineConfig::load_toml(path)
                .with_context(|| format!("load pipeline config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        let cfg = cfg.with_env_overrides();
        cfg.validate().context("pipeline config")?;
        Ok(cfg)
    }
}

/// `RUST_LOG`-driven subscriber, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
