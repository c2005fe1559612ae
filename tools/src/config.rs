use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CONFIG_NAME: &str = "pair-tools.toml";
const DEFAULT_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp", ".tif"];

#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Pipeline TOML (`PipelineConfig`); defaults apply when unset.
    pub pipeline_config: Option<PathBuf>,
    pub output_root: PathBuf,
    pub extensions: Vec<String>,
    /// Default `column = value and ...` filter for manifest queries.
    pub manifest_query: String,
    pub workers: Option<usize>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            pipeline_config: None,
            output_root: PathBuf::from("assets/pairs"),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            manifest_query: String::new(),
            workers: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolConfigFile {
    pipeline_config: Option<String>,
    output_root: Option<String>,
    workers: Option<usize>,
    manifest: Option<ManifestSection>,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestSection {
    query: Option<String>,
    extensions: Option<Vec<String>>,
}

impl ToolConfig {
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("PAIR_TOOLS_CONFIG") {
            let cfg = Self::from_path(Path::new(&path)).unwrap_or_default();
            cfg.warn_if_invalid();
            return cfg;
        }
        let cfg = Self::from_path(Path::new(DEFAULT_CONFIG_NAME)).unwrap_or_default();
        cfg.warn_if_invalid();
        cfg
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let raw = std::fs::read_to_string(path).ok()?;
        let file: ToolConfigFile = match toml::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable tools config");
                return None;
            }
        };
        Some(Self::from_file(file))
    }

    pub fn extension_filters(&self) -> Vec<&str> {
        self.extensions.iter().map(String::as_str).collect()
    }

    fn from_file(file: ToolConfigFile) -> Self {
        let defaults = Self::default();
        let manifest = file.manifest.unwrap_or_default();
        ToolConfig {
            pipeline_config: file.pipeline_config.map(|v| expand_path(&v)),
            output_root: file
                .output_root
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.output_root),
            extensions: manifest.extensions.unwrap_or(defaults.extensions),
            manifest_query: manifest.query.unwrap_or_default(),
            workers: file.workers,
        }
    }

    fn warn_if_invalid(&self) {
        if let Some(path) = &self.pipeline_config {
            if !path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "tools config: pipeline_config does not exist; pipeline defaults will be used"
                );
            }
        }
        if self.workers == Some(0) {
            tracing::warn!("tools config: workers = 0; falling back to one worker");
        }
        if self.output_root.as_os_str().is_empty() {
            tracing::warn!("tools config: output_root is empty; pair_convert will write to the working directory");
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
