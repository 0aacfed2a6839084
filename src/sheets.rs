//! Tabular input/output boundary.
//!
//! Input: `.xlsx`/`.xls` workbooks read through calamine, one `TabRows`
//! per matching sheet. Output: the final stitched report written through
//! rust_xlsxwriter. Rows are ordered column lists plus loosely-typed JSON
//! cells; the pipeline itself never cares what the passthrough columns
//! mean, only that the key column is present.

use anyhow::{anyhow, Context, Result};
use calamine::{DataType, Reader as CalamineReader, Xls, Xlsx};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Excel caps sheet names at 31 characters.
const MAX_SHEET_NAME: usize = 31;

/// One sheet's worth of rows: header order plus one loose map per row.
///
/// `columns` preserves sheet header order; enrichment columns are appended
/// in first-appearance order. Cells absent from a row's map render empty.
#[derive(Debug, Clone, PartialEq)]
pub struct TabRows {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, Value>>,
}

impl TabRows {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn ensure_column(&mut self, name: &str) {
        if !self.columns.iter().any(|existing| existing == name) {
            self.columns.push(name.to_string());
        }
    }

    /// Stable sort by the key column so "resume past key X" is well-defined.
    /// Keys compare as lexical byte strings; keyless rows sort first.
    pub fn sort_by_key(&mut self, key_column: &str) {
        self.rows
            .sort_by(|a, b| row_key(a, key_column).cmp(&row_key(b, key_column)));
    }
}

/// The row's key (ASIN) as a comparable string, if the cell holds one.
pub fn row_key(row: &BTreeMap<String, Value>, key_column: &str) -> Option<String> {
    match row.get(key_column)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Discover input spreadsheets: `~` expands, extensions match
/// case-insensitively, Excel lock files (`~$...`) are skipped, and the
/// absolute paths come back sorted so iteration order is fixed.
pub fn discover_input_files(input_dir: &str) -> Result<Vec<PathBuf>> {
    let expanded = expand_tilde(input_dir);
    let entries = std::fs::read_dir(&expanded)
        .with_context(|| format!("read input directory {}", expanded.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("scan {}", expanded.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = crate::util::file_name_string(&path);
        if name.starts_with("~$") {
            continue;
        }
        let is_spreadsheet = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("xlsx") || ext.eq_ignore_ascii_case("xls"))
            .unwrap_or(false);
        if !is_spreadsheet {
            continue;
        }
        let absolute = path
            .canonicalize()
            .with_context(|| format!("resolve {}", path.display()))?;
        files.push(absolute);
    }
    files.sort();
    Ok(files)
}

pub fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

/// An opened input workbook, `.xlsx` or legacy `.xls`.
pub enum Workbook {
    Xlsx(Xlsx<BufReader<File>>),
    Xls(Xls<BufReader<File>>),
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self> {
        let is_xls = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("xls"))
            .unwrap_or(false);
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let reader = BufReader::new(file);
        if is_xls {
            let workbook = Xls::new(reader)
                .map_err(|err| anyhow!("read xls workbook {}: {err}", path.display()))?;
            Ok(Workbook::Xls(workbook))
        } else {
            let workbook = Xlsx::new(reader)
                .map_err(|err| anyhow!("read xlsx workbook {}: {err}", path.display()))?;
            Ok(Workbook::Xlsx(workbook))
        }
    }

    pub fn sheet_names(&self) -> Vec<String> {
        match self {
            Workbook::Xlsx(workbook) => workbook.sheet_names().to_vec(),
            Workbook::Xls(workbook) => workbook.sheet_names().to_vec(),
        }
    }

    /// Sheet names matching `pattern`, in workbook order.
    pub fn matching_tabs(&self, pattern: &Regex) -> Vec<String> {
        self.sheet_names()
            .into_iter()
            .filter(|name| pattern.is_match(name))
            .collect()
    }

    /// Read one sheet: first row is the header, remaining rows become
    /// cell maps. Empty cells are omitted; all-empty rows are dropped.
    pub fn read_tab(&mut self, tab: &str) -> Result<TabRows> {
        let range = match self {
            Workbook::Xlsx(workbook) => workbook
                .worksheet_range(tab)
                .map(|result| result.map_err(|err| anyhow!("read sheet {tab}: {err}"))),
            Workbook::Xls(workbook) => workbook
                .worksheet_range(tab)
                .map(|result| result.map_err(|err| anyhow!("read sheet {tab}: {err}"))),
        };
        let range = match range {
            Some(Ok(range)) => range,
            Some(Err(err)) => return Err(err),
            None => return Err(anyhow!("sheet {tab} not found")),
        };

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            return Ok(TabRows::new(Vec::new()));
        };
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let text = cell_to_value(cell)
                    .map(|value| value_to_text(&value))
                    .unwrap_or_default();
                let text = text.trim();
                if text.is_empty() {
                    format!("column_{index}")
                } else {
                    text.to_string()
                }
            })
            .collect();

        let mut tab_rows = TabRows::new(columns);
        for row in rows {
            let mut cells = BTreeMap::new();
            for (column, cell) in tab_rows.columns.iter().zip(row.iter()) {
                if let Some(value) = cell_to_value(cell) {
                    cells.insert(column.clone(), value);
                }
            }
            if cells.is_empty() {
                continue;
            }
            tab_rows.rows.push(cells);
        }
        Ok(tab_rows)
    }
}

/// Decode one calamine cell; `None` means empty (the cell is omitted).
/// Integral floats collapse to integers so cell typing is stable across
/// the staging round trip.
fn cell_to_value(cell: &DataType) -> Option<Value> {
    match cell {
        DataType::Empty => None,
        DataType::String(text) => Some(Value::String(text.clone())),
        DataType::Int(int) => Some(Value::Number((*int).into())),
        DataType::Float(float) | DataType::DateTime(float) | DataType::Duration(float) => {
            if float.fract() == 0.0 && float.abs() < (i64::MAX as f64) {
                Some(Value::Number((*float as i64).into()))
            } else {
                Number::from_f64(*float).map(Value::Number)
            }
        }
        DataType::Bool(flag) => Some(Value::Bool(*flag)),
        DataType::DateTimeIso(text) | DataType::DurationIso(text) => {
            Some(Value::String(text.clone()))
        }
        DataType::Error(_) => None,
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => other.to_string(),
    }
}

/// Write the stitched report: one sheet per staged tab, header row first,
/// numbers as numbers so downstream spreadsheets can aggregate them.
pub fn write_workbook(path: &Path, sheets: &[(String, TabRows)]) -> Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    for (name, tab_rows) in sheets {
        let worksheet = workbook.add_worksheet();
        let name: String = name.chars().take(MAX_SHEET_NAME).collect();
        worksheet
            .set_name(&name)
            .with_context(|| format!("name sheet {name}"))?;
        for (col, column) in tab_rows.columns.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, column)
                .with_context(|| format!("write header of sheet {name}"))?;
        }
        for (row_index, row) in tab_rows.rows.iter().enumerate() {
            let excel_row = row_index as u32 + 1;
            for (col, column) in tab_rows.columns.iter().enumerate() {
                let col = col as u16;
                match row.get(column) {
                    None | Some(Value::Null) => {}
                    Some(Value::Number(number)) => {
                        let float = number.as_f64().unwrap_or(0.0);
                        worksheet
                            .write_number(excel_row, col, float)
                            .with_context(|| format!("write sheet {name}"))?;
                    }
                    Some(Value::Bool(flag)) => {
                        worksheet
                            .write_boolean(excel_row, col, *flag)
                            .with_context(|| format!("write sheet {name}"))?;
                    }
                    Some(other) => {
                        worksheet
                            .write_string(excel_row, col, value_to_text(other))
                            .with_context(|| format!("write sheet {name}"))?;
                    }
                }
            }
        }
    }
    workbook
        .save(path)
        .with_context(|| format!("write workbook {}", path.display()))?;
    Ok(())
}

/// Build a small xlsx fixture on disk, all cells as text.
#[cfg(test)]
pub(crate) fn write_fixture_workbook(
    path: &Path,
    sheets: &[(&str, &[&str], &[&[&str]])],
) -> Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    for (name, columns, rows) in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(*name)?;
        for (col, column) in columns.iter().enumerate() {
            worksheet.write_string(0, col as u16, *column)?;
        }
        for (row_index, row) in rows.iter().enumerate() {
            for (col, cell) in row.iter().enumerate() {
                worksheet.write_string(row_index as u32 + 1, col as u16, *cell)?;
            }
        }
    }
    workbook.save(path)?;
    Ok(())
}
