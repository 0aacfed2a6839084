//! On-disk response cache for fetched marketplace records.
//!
//! One JSON file per (ASIN, calendar day): `cache/<asin>_<YYYY-MM-DD>.json`.
//! Freshness is measured in whole days against the date embedded in the
//! filename; stale entries are left in place and simply stop matching, so
//! the directory doubles as an audit trail of what was fetched when. Every
//! failure path degrades to a cache miss: the pipeline must tolerate a
//! non-durable cache.

use chrono::NaiveDate;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ResponseCache {
    dir: PathBuf,
    max_age_days: i64,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(dir: PathBuf, max_age_days: i64, enabled: bool) -> Self {
        Self {
            dir,
            max_age_days,
            enabled,
        }
    }

    /// Create the cache directory. Failure disables nothing: reads and
    /// writes already degrade to misses on their own.
    pub fn ensure_dir(&self) {
        if !self.enabled {
            return;
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), %err, "failed to create cache directory");
        }
    }

    fn entry_path(&self, asin: &str, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{asin}_{date}.json"))
    }

    /// Most recent entry for `asin` within the freshness window, or a miss.
    pub fn read(&self, asin: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let newest = self.newest_entry_date(asin)?;
        let age_days = (chrono::Local::now().date_naive() - newest).num_days();
        if age_days > self.max_age_days {
            debug!(%asin, %newest, age_days, "cache entry too old");
            return None;
        }
        let path = self.entry_path(asin, newest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read cache entry");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(%asin, %newest, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to parse cache entry");
                None
            }
        }
    }

    /// Persist `record` under today's entry for `asin`. Write failures are
    /// logged and swallowed.
    pub fn write(&self, asin: &str, record: &Value) {
        if !self.enabled {
            return;
        }
        let path = self.entry_path(asin, chrono::Local::now().date_naive());
        let text = match serde_json::to_string(record) {
            Ok(text) => text,
            Err(err) => {
                warn!(%asin, %err, "failed to serialize cache entry");
                return;
            }
        };
        if let Err(err) = fs::write(&path, text.as_bytes()) {
            warn!(path = %path.display(), %err, "failed to write cache entry");
        }
    }

    /// Newest stored date for `asin`, scanning `<asin>_<date>.json` filenames.
    fn newest_entry_date(&self, asin: &str) -> Option<NaiveDate> {
        let prefix = format!("{asin}_");
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return None,
        };
        let mut newest: Option<NaiveDate> = None;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(date_part) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
                continue;
            };
            newest = Some(match newest {
                Some(current) if current >= date => current,
                _ => date,
            });
        }
        newest
    }
}
