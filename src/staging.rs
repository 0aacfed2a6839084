//! Staged per-tab CSV checkpoints.
//!
//! Every checkpoint overwrites one CSV under `staging/` holding the rows
//! enriched so far. A resumed run reloads these files instead of refetching,
//! and the final report is stitched from them, so encode/decode must be
//! byte-stable: a value only comes back typed if re-rendering it reproduces
//! the exact staged text.

use anyhow::{Context, Result};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::sheets::{value_to_text, TabRows};
use crate::util::{file_name_string, sanitize_component};

pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            dir: output_dir.join("staging"),
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create staging directory {}", self.dir.display()))
    }

    /// `staging/<input file name>_<tab>.csv`, with both parts sanitized so
    /// sheet names with path separators cannot escape the directory.
    pub fn tab_path(&self, input_file: &Path, tab: &str) -> PathBuf {
        let file = sanitize_component(&file_name_string(input_file));
        let tab = sanitize_component(tab);
        self.dir.join(format!("{file}_{tab}.csv"))
    }

    /// Overwrite the staged CSV for one tab. The bytes are built in memory
    /// and published with a rename so a crash never leaves a torn file.
    pub fn write_tab(&self, input_file: &Path, tab: &str, rows: &TabRows) -> Result<()> {
        let path = self.tab_path(input_file, tab);
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&rows.columns)
            .context("encode staged header")?;
        for row in &rows.rows {
            let record: Vec<String> = rows
                .columns
                .iter()
                .map(|column| row.get(column).map(value_to_text).unwrap_or_default())
                .collect();
            writer.write_record(&record).context("encode staged row")?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flush staged csv: {err}"))?;

        let tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("create temp file in {}", self.dir.display()))?;
        std::fs::write(tmp.path(), &bytes)
            .with_context(|| format!("write staged rows for {tab}"))?;
        tmp.persist(&path)
            .with_context(|| format!("publish {}", path.display()))?;
        debug!(
            path = %path.display(),
            rows = rows.rows.len(),
            "staged tab"
        );
        Ok(())
    }

    /// Load a staged tab if one exists. Cells decode conservatively:
    /// a field becomes a number or boolean only when re-rendering that
    /// value reproduces the staged text exactly, so `"007"` stays a
    /// string and a reload-then-restage is byte-identical.
    pub fn load_tab(&self, input_file: &Path, tab: &str) -> Result<Option<TabRows>> {
        let path = self.tab_path(input_file, tab);
        if !path.exists() {
            return Ok(None);
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let columns: Vec<String> = reader
            .headers()
            .with_context(|| format!("read header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = TabRows::new(columns);
        for record in reader.records() {
            let record = record.with_context(|| format!("read {}", path.display()))?;
            let mut cells = BTreeMap::new();
            for (column, field) in rows.columns.iter().zip(record.iter()) {
                if let Some(value) = decode_field(field) {
                    cells.insert(column.clone(), value);
                }
            }
            rows.rows.push(cells);
        }
        Ok(Some(rows))
    }
}

fn decode_field(field: &str) -> Option<Value> {
    if field.is_empty() {
        return None;
    }
    match field {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(int) = field.parse::<i64>() {
        if int.to_string() == field {
            return Some(Value::Number(int.into()));
        }
    }
    if let Ok(float) = field.parse::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            if number.to_string() == field {
                return Some(Value::Number(number));
            }
        }
    }
    Some(Value::String(field.to_string()))
}
