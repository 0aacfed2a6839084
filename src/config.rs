//! Run configuration for the enrichment pipeline.
//!
//! Configuration resolves in three layers: built-in defaults, an optional
//! JSON config file, then CLI flag overrides (applied by `cli.rs`). The
//! enrichment column map is configuration rather than data: it declares
//! which provider fields land in the output and what type each one is
//! coerced to.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const DEFAULT_TAB_REGEX: &str = r"^Detail_\d+";
pub const DEFAULT_KEY_COLUMN: &str = "B00 ASIN";
pub const DEFAULT_COLUMN_PREFIX: &str = "keepa_";
pub const DEFAULT_LOG_NAME: &str = "deal_analyzer.log";

/// Declared output type for an enrichment column.
///
/// Coercion semantics (see `enrich::coerce`): `int` failures fill with zero,
/// `float` failures yield null, `str` conversion is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Float,
    Str,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Str => "str",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    /// Directory scanned for `.xlsx`/`.xls` input files (`~` expands).
    pub input_dir: String,
    /// Output directory; defaults to a name derived from the input files.
    pub output_dir: Option<String>,
    /// Sheets whose names match this pattern are processed.
    pub tab_regex: String,
    /// Column holding the per-row ASIN.
    pub key_column: String,
    /// Marketplace domain passed to the metadata provider.
    pub domain: String,
    /// Interval, in days, for provider price statistics.
    pub lookback_days: u32,
    /// Cached provider responses older than this many whole days are misses.
    pub cache_max_age_days: i64,
    /// Rows between staging/manifest checkpoints.
    pub checkpoint_interval: usize,
    /// Disable to force a provider round-trip for every row.
    pub enable_cache: bool,
    /// Prefix applied to enrichment columns to avoid clashing with sheet columns.
    pub column_prefix: String,
    /// Provider fields to extract, each with its declared output type.
    pub enrichment_columns: BTreeMap<String, ColumnType>,
    /// Log filename created inside the output directory.
    pub log_name: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_dir: "~/deal_analyzer_input".to_string(),
            output_dir: None,
            tab_regex: DEFAULT_TAB_REGEX.to_string(),
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            domain: "CA".to_string(),
            lookback_days: 30,
            cache_max_age_days: 7,
            checkpoint_interval: 10,
            enable_cache: true,
            column_prefix: DEFAULT_COLUMN_PREFIX.to_string(),
            enrichment_columns: default_enrichment_columns(),
            log_name: DEFAULT_LOG_NAME.to_string(),
        }
    }
}

pub fn default_enrichment_columns() -> BTreeMap<String, ColumnType> {
    let mut columns = BTreeMap::new();
    columns.insert("title".to_string(), ColumnType::Str);
    columns.insert("brand".to_string(), ColumnType::Str);
    columns.insert("categoryTree".to_string(), ColumnType::Str);
    columns.insert("salesRank".to_string(), ColumnType::Int);
    columns.insert("minPrice".to_string(), ColumnType::Float);
    columns.insert("maxPrice".to_string(), ColumnType::Float);
    columns.insert("avgPrice".to_string(), ColumnType::Float);
    columns.insert("minIntervalPrice".to_string(), ColumnType::Float);
    columns.insert("maxIntervalPrice".to_string(), ColumnType::Float);
    columns
}

/// Load config from `path`; a missing file yields defaults, a malformed
/// file is a structural error (fatal at startup, before any state exists).
pub fn load(path: &Path) -> Result<RunConfig> {
    if !path.is_file() {
        return Ok(RunConfig::default());
    }
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: RunConfig =
        serde_json::from_slice(&bytes).with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

pub fn validate(config: &RunConfig) -> Result<()> {
    if config.checkpoint_interval == 0 {
        return Err(anyhow!("checkpoint_interval must be at least 1"));
    }
    regex::Regex::new(&config.tab_regex)
        .with_context(|| format!("invalid tab_regex {:?}", config.tab_regex))?;
    if config.key_column.trim().is_empty() {
        return Err(anyhow!("key_column must be non-empty"));
    }
    if config.enrichment_columns.is_empty() {
        return Err(anyhow!("enrichment_columns must declare at least one field"));
    }
    Ok(())
}
