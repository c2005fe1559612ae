//! Manifest resolution: record sources and filesystem walks to ordered
//! sample descriptors.

use crate::types::{ManifestError, ManifestResult};
use data_contracts::{ManifestRow, SampleDescriptor, IMAGE_PATH_COLUMN};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Conjunction of `column = value` predicates. Empty selects every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestQuery {
    predicates: Vec<(String, String)>,
}

impl ManifestQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Text equality, falling back to numeric comparison so `0` matches `0.0`.
    pub fn matches(&self, row: &ManifestRow) -> bool {
        self.predicates.iter().all(|(column, expected)| {
            let Some(actual) = row.fields.get(column).map(|v| v.trim()) else {
                return false;
            };
            if actual == expected {
                return true;
            }
            match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            }
        })
    }
}

impl FromStr for ManifestQuery {
    type Err = ManifestError;

    /// Parses `col = value and col2 = 'value'`; `and` is case-insensitive.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let mut query = ManifestQuery::all();
        if text.is_empty() {
            return Ok(query);
        }
        for clause in split_clauses(text) {
            let Some((column, value)) = clause.split_once('=') else {
                return Err(ManifestError::Query {
                    query: text.to_string(),
                    msg: format!("clause {clause:?} is not `column = value`"),
                });
            };
            let column = column.trim();
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            if column.is_empty() {
                return Err(ManifestError::Query {
                    query: text.to_string(),
                    msg: format!("clause {clause:?} has no column"),
                });
            }
            query = query.and_eq(column, value);
        }
        Ok(query)
    }
}

/// Split on ` and ` (any case) outside single or double quotes.
fn split_clauses(text: &str) -> Vec<&str> {
    const SEP: &str = " and ";
    let mut clauses = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut skip_until = 0;
    for (idx, c) in text.char_indices() {
        if idx < skip_until {
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                let at_sep = text
                    .get(idx..idx + SEP.len())
                    .is_some_and(|s| s.eq_ignore_ascii_case(SEP));
                if at_sep {
                    clauses.push(&text[start..idx]);
                    start = idx + SEP.len();
                    skip_until = start;
                }
            }
        }
    }
    clauses.push(&text[start..]);
    clauses
}

/// External record source. The caller owns its lifecycle.
pub trait ManifestSource {
    fn describe(&self) -> String;

    /// Directory that relative image paths are resolved against.
    fn base_dir(&self) -> Option<&Path> {
        None
    }

    fn query(&self, query: &ManifestQuery) -> ManifestResult<Vec<ManifestRow>>;
}

/// CSV file with a header row. `image_path` is required; crop columns hold
/// rectangle literals such as `((0, 0), (64, 64))`.
#[derive(Debug, Clone)]
pub struct CsvManifestSource {
    path: PathBuf,
    base_dir: Option<PathBuf>,
}

impl CsvManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base_dir = path.parent().map(Path::to_path_buf);
        Self { path, base_dir }
    }

    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ManifestSource for CsvManifestSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    fn query(&self, query: &ManifestQuery) -> ManifestResult<Vec<ManifestRow>> {
        let file = File::open(&self.path).map_err(|source| ManifestError::Unreachable {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = csv::Reader::from_reader(file);
        let headers = reader
            .headers()
            .map_err(|source| ManifestError::Csv {
                path: self.path.clone(),
                source,
            })?
            .clone();
        if !headers.iter().any(|h| h.trim() == IMAGE_PATH_COLUMN) {
            return Err(ManifestError::Malformed {
                origin: self.describe(),
                msg: format!("missing required column {IMAGE_PATH_COLUMN:?}"),
            });
        }
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|source| ManifestError::Csv {
                path: self.path.clone(),
                source,
            })?;
            let fields: BTreeMap<String, String> = headers
                .iter()
                .zip(record.iter())
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .collect();
            let row = ManifestRow::from_fields(fields).map_err(|e| ManifestError::Malformed {
                origin: self.describe(),
                msg: format!("record {}: {e}", line + 1),
            })?;
            if query.matches(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

/// In-memory rows; handy for tests and for callers that already hold records.
#[derive(Debug, Clone, Default)]
pub struct StaticManifestSource {
    rows: Vec<ManifestRow>,
    base_dir: Option<PathBuf>,
}

impl StaticManifestSource {
    pub fn new(rows: Vec<ManifestRow>) -> Self {
        Self {
            rows,
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base.into());
        self
    }
}

impl ManifestSource for StaticManifestSource {
    fn describe(&self) -> String {
        format!("static:{} rows", self.rows.len())
    }

    fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    fn query(&self, query: &ManifestQuery) -> ManifestResult<Vec<ManifestRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect())
    }
}

/// Query `source` and return descriptors sorted by identity. Rows that
/// resolve to an identity already seen are dropped with a warning.
pub fn resolve_query(
    source: &dyn ManifestSource,
    query: &ManifestQuery,
) -> ManifestResult<Vec<SampleDescriptor>> {
    let rows = source.query(query)?;
    let base = source.base_dir();
    let mut keyed = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            row.to_descriptor(base)
                .map(|d| (d.identity(), d))
                .map_err(|e| ManifestError::Malformed {
                    origin: source.describe(),
                    msg: format!("row {} ({}): {e}", idx + 1, row.image_path),
                })
        })
        .collect::<ManifestResult<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let before = keyed.len();
    keyed.dedup_by(|a, b| a.0 == b.0);
    let duplicates = before - keyed.len();
    if duplicates > 0 {
        tracing::warn!(
            source = %source.describe(),
            duplicates,
            "dropped manifest rows with duplicate sample identities"
        );
    }
    tracing::info!(
        source = %source.describe(),
        rows = rows.len(),
        samples = keyed.len(),
        "resolved manifest query"
    );
    Ok(keyed.into_iter().map(|(_, d)| d).collect())
}

/// Recursively collect files under `root` whose name contains any of
/// `extensions` (all files when empty). Paths are absolute and sorted.
pub fn resolve_root(root: &Path, extensions: &[&str]) -> ManifestResult<Vec<SampleDescriptor>> {
    resolve_roots(&[root], extensions)
}

pub fn resolve_roots<P: AsRef<Path>>(
    roots: &[P],
    extensions: &[&str],
) -> ManifestResult<Vec<SampleDescriptor>> {
    let mut paths = Vec::new();
    for root in roots {
        let root = root.as_ref();
        let abs = root
            .canonicalize()
            .map_err(|_| ManifestError::RootMissing(root.to_path_buf()))?;
        if !abs.is_dir() {
            return Err(ManifestError::RootMissing(root.to_path_buf()));
        }
        for entry in WalkDir::new(&abs) {
            let entry = entry.map_err(|source| ManifestError::Walk {
                root: abs.clone(),
                source,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if extensions.is_empty() || extensions.iter().any(|ext| name.contains(ext)) {
                paths.push(entry.into_path());
            }
        }
    }
    paths.sort();
    paths.dedup();
    tracing::info!(roots = roots.len(), samples = paths.len(), "resolved manifest roots");
    Ok(paths.into_iter().map(SampleDescriptor::split).collect())
}
