//! Pipeline driver.
//!
//! Walks every matching tab of every input file in fixed order, enriches
//! rows one at a time, checkpoints the accumulator on a fixed cadence, and
//! stitches the staged tabs into the final report. Resume decisions come
//! from the manifest alone; staged files are data, never position.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::enrich::shape_record;
use crate::keepa::ProductSource;
use crate::manifest::{ManifestStore, ResumePoint, RunStatus};
use crate::sheets::{row_key, write_workbook, TabRows, Workbook};
use crate::staging::StagingStore;
use crate::util::file_stem_string;

pub struct Driver<'a> {
    config: &'a RunConfig,
    source: &'a dyn ProductSource,
    manifest: ManifestStore,
    staging: StagingStore,
    tab_pattern: Regex,
    output_dir: PathBuf,
    // Captured from the loaded manifest before any mutation; a position
    // written during this run must never feed this run's resume filter.
    resume: Option<ResumePoint>,
    resumed: bool,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a RunConfig,
        source: &'a dyn ProductSource,
        output_dir: &Path,
    ) -> Result<Self> {
        let tab_pattern = Regex::new(&config.tab_regex)
            .with_context(|| format!("compile tab pattern {:?}", config.tab_regex))?;
        let staging = StagingStore::new(output_dir);
        staging.ensure_dir()?;
        let mut manifest = ManifestStore::new(output_dir);
        let resumed = manifest.load();
        let resume = if resumed {
            manifest.resume_point()
        } else {
            None
        };
        Ok(Self {
            config,
            source,
            manifest,
            staging,
            tab_pattern,
            output_dir: output_dir.to_path_buf(),
            resume,
            resumed,
        })
    }

    /// Drive the whole run and return the report path.
    pub fn run(&mut self, input_files: &[PathBuf]) -> Result<PathBuf> {
        if self.resumed {
            info!(
                created = %self.manifest.data.creation_time,
                status = %self.manifest.data.status,
                "resuming existing run"
            );
        } else {
            self.manifest.data.input_files = input_files
                .iter()
                .map(|path| path.display().to_string())
                .collect();
        }
        self.manifest.data.status = RunStatus::InProgress;
        self.manifest.save();

        for file in input_files {
            let file_key = file.display().to_string();
            let mut workbook = Workbook::open(file)?;
            let tabs = workbook.matching_tabs(&self.tab_pattern);
            if tabs.is_empty() {
                warn!(file = %file_key, pattern = %self.tab_pattern, "no matching tabs");
                continue;
            }
            for tab in &tabs {
                if self.manifest.is_tab_complete(&file_key, tab) {
                    info!(file = %file_key, %tab, "tab already complete; skipping");
                    continue;
                }
                self.process_tab(&mut workbook, file, tab)?;
            }
        }

        self.finalize(input_files)
    }

    /// Process one tab from its resume position to completion.
    fn process_tab(&mut self, workbook: &mut Workbook, file: &Path, tab: &str) -> Result<()> {
        let file_key = file.display().to_string();
        let resume_asin = self
            .resume
            .as_ref()
            .filter(|point| point.input_file == file_key && point.tab == tab)
            .map(|point| point.asin.clone());

        // Entering a tab records the position and clears any stale key from
        // a previous tab. When the manifest already points at this exact
        // tab the checkpoint key is kept: clearing it before the first new
        // checkpoint would forfeit the staged progress on a crash.
        if resume_asin.is_none() {
            self.manifest.set_position(&file_key, tab);
        }

        let mut source_rows = workbook.read_tab(tab)?;
        source_rows.sort_by_key(&self.config.key_column);
        let total = source_rows.rows.len();

        // On filtered resume the staged rows strictly below the checkpoint
        // key are kept and everything at or above it is reprocessed, so a
        // checkpoint taken mid-row is never double-counted.
        let mut results = TabRows::new(source_rows.columns.clone());
        if let Some(asin) = &resume_asin {
            match self.staging.load_tab(file, tab)? {
                Some(staged) => {
                    results = TabRows::new(staged.columns.clone());
                    results.rows = staged
                        .rows
                        .into_iter()
                        .filter(|row| {
                            row_key(row, &self.config.key_column)
                                .is_some_and(|key| key.as_str() < asin.as_str())
                        })
                        .collect();
                    source_rows.rows.retain(|row| {
                        match row_key(row, &self.config.key_column) {
                            Some(key) => key.as_str() >= asin.as_str(),
                            None => {
                                warn!(
                                    %tab,
                                    "row without a {} value; skipped",
                                    self.config.key_column
                                );
                                false
                            }
                        }
                    });
                    info!(
                        %tab,
                        staged = results.rows.len(),
                        remaining = source_rows.rows.len(),
                        resume_key = %asin,
                        "resuming tab past checkpoint"
                    );
                }
                None => {
                    warn!(%tab, "manifest names a resume key but no staged rows exist; restarting tab");
                }
            }
        }

        info!(file = %file_key, %tab, rows = total, "processing tab");
        for row in std::mem::take(&mut source_rows.rows) {
            let Some(key) = row_key(&row, &self.config.key_column) else {
                warn!(%tab, "row without a {} value; skipped", self.config.key_column);
                continue;
            };
            let mut merged = row;
            match self.source.fetch_one(&key) {
                Some(record) => {
                    let shaped = shape_record(
                        &record,
                        &self.config.enrichment_columns,
                        &self.config.column_prefix,
                    );
                    for (column, value) in shaped {
                        if column == "asin" {
                            continue;
                        }
                        results.ensure_column(&column);
                        merged.insert(column, value);
                    }
                }
                None => warn!(%key, "no enrichment data; row passes through unchanged"),
            }
            results.rows.push(merged);

            if results.rows.len() % self.config.checkpoint_interval == 0 {
                match self.staging.write_tab(file, tab, &results) {
                    Ok(()) => {
                        self.manifest.update_progress(&file_key, tab, &key);
                        info!(%tab, rows = results.rows.len(), last_key = %key, "checkpoint");
                    }
                    // Forward progress beats durability for a mid-tab
                    // checkpoint; the final write below still gates
                    // completion.
                    Err(err) => error!(%tab, "checkpoint staging write failed: {err:#}"),
                }
            }
        }

        self.staging
            .write_tab(file, tab, &results)
            .with_context(|| format!("persist final rows for tab {tab}"))?;
        self.manifest.mark_tab_complete(&file_key, tab);
        info!(file = %file_key, %tab, rows = results.rows.len(), "tab complete");
        Ok(())
    }

    /// Stitch every staged tab into the report workbook, in file/tab order.
    fn finalize(&mut self, input_files: &[PathBuf]) -> Result<PathBuf> {
        let first = input_files
            .first()
            .ok_or_else(|| anyhow!("no input files to finalize"))?;
        let report = self
            .output_dir
            .join(format!("{}_result.xlsx", file_stem_string(first)));

        let mut sheets = Vec::new();
        for file in input_files {
            let file_key = file.display().to_string();
            for tab in self.manifest.completed_for(&file_key).to_vec() {
                let rows = self.staging.load_tab(file, &tab)?.ok_or_else(|| {
                    anyhow!("staged rows for completed tab {tab} of {file_key} are missing")
                })?;
                sheets.push((format!("{tab}-result"), rows));
            }
        }
        write_workbook(&report, &sheets)?;

        self.manifest
            .mark_completed(vec![report.display().to_string()]);
        info!(report = %report.display(), sheets = sheets.len(), "run complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnType;
    use crate::sheets::write_fixture_workbook;
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Deterministic source: records every fetch, returns `{sku: key}`.
    struct StubSource {
        calls: RefCell<Vec<String>>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProductSource for StubSource {
        fn fetch_one(&self, asin: &str) -> Option<Value> {
            self.calls.borrow_mut().push(asin.to_string());
            Some(json!({ "asin": asin, "sku": asin }))
        }
    }

    fn test_config() -> RunConfig {
        RunConfig {
            checkpoint_interval: 10,
            column_prefix: String::new(),
            enrichment_columns: BTreeMap::from([("sku".to_string(), ColumnType::Str)]),
            ..RunConfig::default()
        }
    }

    fn keys(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("A{index:04}")).collect()
    }

    fn fixture_file(dir: &Path, name: &str, tab: &str, keys: &[String]) -> PathBuf {
        let path = dir.join(name);
        let rows: Vec<Vec<&str>> = keys
            .iter()
            .map(|key| vec![key.as_str(), "3"])
            .collect();
        let row_refs: Vec<&[&str]> = rows.iter().map(Vec::as_slice).collect();
        write_fixture_workbook(&path, &[(tab, &["B00 ASIN", "Quantity"], row_refs.as_slice())])
            .expect("write fixture workbook");
        path
    }

    fn read_report_sheet(path: &Path, sheet: &str) -> TabRows {
        let mut workbook = Workbook::open(path).expect("open report");
        workbook.read_tab(sheet).expect("read report sheet")
    }

    #[test]
    fn fresh_run_enriches_both_files_and_writes_the_report() {
        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let keys = keys(25);
        let files = vec![
            fixture_file(input.path(), "june.xlsx", "Detail_1", &keys),
            fixture_file(input.path(), "july.xlsx", "Detail_2", &keys),
        ];

        let config = test_config();
        let source = StubSource::new();
        let mut driver = Driver::new(&config, &source, output.path()).expect("driver");
        let report = driver.run(&files).expect("run");

        // Both tabs staged in full and recorded as complete.
        let staging = StagingStore::new(output.path());
        for (file, tab) in [(&files[0], "Detail_1"), (&files[1], "Detail_2")] {
            let staged = staging
                .load_tab(file, tab)
                .expect("load staged")
                .expect("staged file present");
            assert_eq!(staged.rows.len(), 25);
        }
        let mut manifest = ManifestStore::new(output.path());
        assert!(manifest.load());
        assert_eq!(manifest.data.status, RunStatus::Completed);
        assert_eq!(
            manifest.completed_for(&files[0].display().to_string()),
            ["Detail_1"]
        );
        assert_eq!(
            manifest.completed_for(&files[1].display().to_string()),
            ["Detail_2"]
        );
        assert!(manifest.data.current_asin.is_none());

        // The report carries original columns plus the enrichment column.
        assert_eq!(crate::util::file_name_string(&report), "june_result.xlsx");
        let sheet = read_report_sheet(&report, "Detail_1-result");
        assert_eq!(sheet.columns, ["B00 ASIN", "Quantity", "sku"]);
        assert_eq!(sheet.rows.len(), 25);
        for row in &sheet.rows {
            assert_eq!(row["sku"], row["B00 ASIN"]);
        }
        assert_eq!(read_report_sheet(&report, "Detail_2-result").rows.len(), 25);

        assert_eq!(source.calls.borrow().len(), 50);
    }

    /// Interrupt after the second checkpoint, then re-run against the same
    /// output directory. The staged bytes and stitched report must match an
    /// uninterrupted run exactly, with no row fetched or emitted twice.
    #[test]
    fn resumed_run_matches_an_uninterrupted_run() {
        let input = tempfile::tempdir().expect("tempdir");
        let keys = keys(25);
        let file = fixture_file(input.path(), "june.xlsx", "Detail_1", &keys);
        let files = vec![file.clone()];
        let config = test_config();

        // Reference: a run that never stops.
        let reference_out = tempfile::tempdir().expect("tempdir");
        let reference_source = StubSource::new();
        Driver::new(&config, &reference_source, reference_out.path())
            .expect("driver")
            .run(&files)
            .expect("reference run");
        let reference_staging = StagingStore::new(reference_out.path());
        let reference_bytes =
            std::fs::read(reference_staging.tab_path(&file, "Detail_1")).expect("staged bytes");

        // Interrupted: stage the first 20 rows by hand, exactly as a run
        // killed after its second checkpoint would have left them, with the
        // manifest pointing at the 20th key.
        let resumed_out = tempfile::tempdir().expect("tempdir");
        let staging = StagingStore::new(resumed_out.path());
        staging.ensure_dir().expect("staging dir");
        let mut staged = TabRows::new(vec![
            "B00 ASIN".to_string(),
            "Quantity".to_string(),
            "sku".to_string(),
        ]);
        for key in &keys[..20] {
            let mut row = BTreeMap::new();
            row.insert("B00 ASIN".to_string(), json!(key));
            row.insert("Quantity".to_string(), json!(3));
            row.insert("sku".to_string(), json!(key));
            staged.rows.push(row);
        }
        staging
            .write_tab(&file, "Detail_1", &staged)
            .expect("stage partial rows");
        let mut manifest = ManifestStore::new(resumed_out.path());
        manifest.data.status = RunStatus::InProgress;
        manifest.data.input_files = vec![file.display().to_string()];
        manifest.update_progress(&file.display().to_string(), "Detail_1", &keys[19]);
        manifest.save();

        let resumed_source = StubSource::new();
        let report = Driver::new(&config, &resumed_source, resumed_out.path())
            .expect("driver")
            .run(&files)
            .expect("resumed run");

        // Only the checkpoint key and later rows are refetched.
        let calls = resumed_source.calls.borrow();
        assert_eq!(calls.as_slice(), &keys[19..]);

        let resumed_bytes =
            std::fs::read(staging.tab_path(&file, "Detail_1")).expect("staged bytes");
        assert_eq!(resumed_bytes, reference_bytes);

        // Every key appears exactly once in the stitched sheet.
        let sheet = read_report_sheet(&report, "Detail_1-result");
        let emitted: Vec<String> = sheet
            .rows
            .iter()
            .filter_map(|row| row_key(row, "B00 ASIN"))
            .collect();
        assert_eq!(emitted, keys);
    }

    #[test]
    fn keyless_rows_are_dropped_on_the_resume_path() {
        let input = tempfile::tempdir().expect("tempdir");
        let keys = keys(25);
        let path = input.path().join("june.xlsx");
        let mut data: Vec<Vec<&str>> = keys
            .iter()
            .map(|key| vec![key.as_str(), "3"])
            .collect();
        data.push(vec!["", "9"]);
        let row_refs: Vec<&[&str]> = data.iter().map(Vec::as_slice).collect();
        write_fixture_workbook(
            &path,
            &[("Detail_1", &["B00 ASIN", "Quantity"], row_refs.as_slice())],
        )
        .expect("write fixture workbook");
        let files = vec![path.clone()];
        let config = test_config();

        let output = tempfile::tempdir().expect("tempdir");
        let staging = StagingStore::new(output.path());
        staging.ensure_dir().expect("staging dir");
        let mut staged = TabRows::new(vec![
            "B00 ASIN".to_string(),
            "Quantity".to_string(),
            "sku".to_string(),
        ]);
        for key in &keys[..20] {
            let mut row = BTreeMap::new();
            row.insert("B00 ASIN".to_string(), json!(key));
            row.insert("Quantity".to_string(), json!(3));
            row.insert("sku".to_string(), json!(key));
            staged.rows.push(row);
        }
        staging
            .write_tab(&path, "Detail_1", &staged)
            .expect("stage partial rows");
        let mut manifest = ManifestStore::new(output.path());
        manifest.data.status = RunStatus::InProgress;
        manifest.data.input_files = vec![path.display().to_string()];
        manifest.update_progress(&path.display().to_string(), "Detail_1", &keys[19]);

        let source = StubSource::new();
        let report = Driver::new(&config, &source, output.path())
            .expect("driver")
            .run(&files)
            .expect("resumed run");

        // The blank-key row is neither fetched nor emitted; the keyed
        // partition is untouched.
        assert_eq!(source.calls.borrow().as_slice(), &keys[19..]);
        let sheet = read_report_sheet(&report, "Detail_1-result");
        let emitted: Vec<String> = sheet
            .rows
            .iter()
            .filter_map(|row| row_key(row, "B00 ASIN"))
            .collect();
        assert_eq!(emitted, keys);
        assert_eq!(sheet.rows.len(), 25);
    }

    #[test]
    fn manifest_position_on_a_different_tab_restarts_from_the_full_row_set() {
        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let keys = keys(25);
        let file = fixture_file(input.path(), "june.xlsx", "Detail_1", &keys);
        let files = vec![file.clone()];
        let config = test_config();

        let mut manifest = ManifestStore::new(output.path());
        manifest.data.status = RunStatus::InProgress;
        manifest.data.input_files = vec![file.display().to_string()];
        manifest.update_progress(&file.display().to_string(), "Detail_9", &keys[9]);
        manifest.save();

        let source = StubSource::new();
        Driver::new(&config, &source, output.path())
            .expect("driver")
            .run(&files)
            .expect("run");

        // No staged rows were trusted; every key was fetched.
        assert_eq!(source.calls.borrow().as_slice(), keys.as_slice());
    }

    #[test]
    fn completed_tabs_are_skipped_without_fetching() {
        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let keys = keys(5);
        let file = fixture_file(input.path(), "june.xlsx", "Detail_1", &keys);
        let files = vec![file.clone()];
        let config = test_config();

        let source = StubSource::new();
        Driver::new(&config, &source, output.path())
            .expect("driver")
            .run(&files)
            .expect("first run");
        let first_calls = source.calls.borrow().len();

        // Re-running against the same output directory refetches nothing.
        Driver::new(&config, &source, output.path())
            .expect("driver")
            .run(&files)
            .expect("second run");
        assert_eq!(source.calls.borrow().len(), first_calls);
    }

    #[test]
    fn empty_tab_completes_with_an_empty_staged_file() {
        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let file = fixture_file(input.path(), "june.xlsx", "Detail_1", &[]);
        let files = vec![file.clone()];
        let config = test_config();

        let source = StubSource::new();
        Driver::new(&config, &source, output.path())
            .expect("driver")
            .run(&files)
            .expect("run");

        assert!(source.calls.borrow().is_empty());
        let staged = StagingStore::new(output.path())
            .load_tab(&file, "Detail_1")
            .expect("load staged")
            .expect("staged file present");
        assert!(staged.rows.is_empty());
        let mut manifest = ManifestStore::new(output.path());
        assert!(manifest.load());
        assert_eq!(manifest.data.status, RunStatus::Completed);
    }

    #[test]
    fn fetch_misses_pass_the_row_through_unchanged() {
        struct MissSource;
        impl ProductSource for MissSource {
            fn fetch_one(&self, _asin: &str) -> Option<Value> {
                None
            }
        }

        let input = tempfile::tempdir().expect("tempdir");
        let output = tempfile::tempdir().expect("tempdir");
        let keys = keys(3);
        let file = fixture_file(input.path(), "june.xlsx", "Detail_1", &keys);
        let files = vec![file.clone()];
        let config = test_config();

        let report = Driver::new(&config, &MissSource, output.path())
            .expect("driver")
            .run(&files)
            .expect("run");

        let sheet = read_report_sheet(&report, "Detail_1-result");
        assert_eq!(sheet.columns, ["B00 ASIN", "Quantity"]);
        assert_eq!(sheet.rows.len(), 3);
    }
}
