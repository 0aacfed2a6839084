//! Durable progress record for a run.
//!
//! `state.json` is the single source of truth for resume decisions: which
//! tabs are complete per input file, and where inside the current tab the
//! last checkpoint landed. Every mutating call persists synchronously, so
//! the on-disk document is never more than one checkpoint interval stale.
//! Saves go through a sibling temp file and an atomic rename, so a crash
//! mid-write can never corrupt the previous valid state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    InProgress,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialized => "initialized",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted manifest document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Set once when the run is created, never rewritten on resume.
    pub creation_time: String,
    /// Absolute input paths fixed at creation; iteration order for the run.
    #[serde(default)]
    pub input_files: Vec<String>,
    /// Final report path(s), recorded at finalize.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Input file -> tabs fully processed, in completion order, no duplicates.
    #[serde(default)]
    pub completed_tabs: BTreeMap<String, Vec<String>>,
    pub current_input_file: Option<String>,
    pub current_tab: Option<String>,
    pub current_asin: Option<String>,
    pub status: RunStatus,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            creation_time: chrono::Local::now().to_rfc3339(),
            input_files: Vec::new(),
            output_files: Vec::new(),
            completed_tabs: BTreeMap::new(),
            current_input_file: None,
            current_tab: None,
            current_asin: None,
            status: RunStatus::Initialized,
        }
    }
}

/// In-flight position captured from a loaded manifest before the driver
/// mutates it. Only an exact (file, tab) match with a non-null ASIN
/// triggers the filtered-resume path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub input_file: String,
    pub tab: String,
    pub asin: String,
}

/// Owns the manifest document plus its on-disk location.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    pub data: Manifest,
}

impl ManifestStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(STATE_FILE),
            data: Manifest::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted document, replacing in-memory state on success.
    ///
    /// A missing file is a fresh run; a parse failure is reported but keeps
    /// the default state so the run can proceed from scratch.
    pub fn load(&mut self) -> bool {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(data) => {
                self.data = data;
                true
            }
            Err(err) => {
                error!(path = %self.path.display(), %err, "failed to parse manifest; starting fresh");
                false
            }
        }
    }

    /// Persist the full in-memory state with an atomic replace.
    ///
    /// A save failure does not halt the run, but repeated failures silently
    /// degrade resumability, so it is logged at error level every time.
    pub fn save(&self) {
        if let Err(err) = self.try_save() {
            error!(path = %self.path.display(), %err, "failed to save manifest; resume state is stale");
        }
    }

    fn try_save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.data).context("serialize manifest")?;
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;
        tmp.write_all(text.as_bytes())
            .with_context(|| format!("write temp manifest in {}", dir.display()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    /// Record the checkpointed in-flight position and persist.
    pub fn update_progress(&mut self, input_file: &str, tab: &str, asin: &str) {
        self.data.current_input_file = Some(input_file.to_string());
        self.data.current_tab = Some(tab.to_string());
        self.data.current_asin = Some(asin.to_string());
        self.data.status = RunStatus::InProgress;
        self.save();
    }

    /// Record entry into a tab before any of its rows are processed.
    ///
    /// Clears `current_asin`: no checkpoint exists for this tab yet, and a
    /// stale ASIN from a previous tab must never trigger a filtered resume.
    pub fn set_position(&mut self, input_file: &str, tab: &str) {
        self.data.current_input_file = Some(input_file.to_string());
        self.data.current_tab = Some(tab.to_string());
        self.data.current_asin = None;
        self.data.status = RunStatus::InProgress;
        self.save();
    }

    /// Add `tab` to the file's completed set (idempotent) and persist.
    ///
    /// Completion clears the in-flight ASIN, upholding the invariant that a
    /// completed tab is never simultaneously the resumable current tab.
    pub fn mark_tab_complete(&mut self, input_file: &str, tab: &str) {
        let tabs = self
            .data
            .completed_tabs
            .entry(input_file.to_string())
            .or_default();
        if !tabs.iter().any(|existing| existing == tab) {
            tabs.push(tab.to_string());
        }
        self.data.current_asin = None;
        self.save();
    }

    /// Record the final report and mark the whole run complete.
    pub fn mark_completed(&mut self, output_files: Vec<String>) {
        self.data.output_files = output_files;
        self.data.current_input_file = None;
        self.data.current_tab = None;
        self.data.current_asin = None;
        self.data.status = RunStatus::Completed;
        self.save();
    }

    pub fn completed_for(&self, input_file: &str) -> &[String] {
        self.data
            .completed_tabs
            .get(input_file)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_tab_complete(&self, input_file: &str, tab: &str) -> bool {
        self.completed_for(input_file)
            .iter()
            .any(|existing| existing == tab)
    }

    /// The resume point, present only when all three in-flight fields are set.
    pub fn resume_point(&self) -> Option<ResumePoint> {
        let input_file = self.data.current_input_file.clone()?;
        let tab = self.data.current_tab.clone()?;
        let asin = self.data.current_asin.clone()?;
        if self.is_tab_complete(&input_file, &tab) {
            // A completed tab with a lingering position would violate the
            // completion invariant; ignore it rather than resume into it.
            warn!(%input_file, %tab, "manifest position names an already-completed tab; ignoring");
            return None;
        }
        Some(ResumePoint {
            input_file,
            tab,
            asin,
        })
    }
}
