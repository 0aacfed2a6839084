//! Keepa marketplace client behind the `ProductSource` boundary.
//!
//! The pipeline only depends on `ProductSource`: fetch one raw record per
//! ASIN, or nothing. The concrete client consults the on-disk response
//! cache first and falls back to the Keepa product endpoint; every
//! per-ASIN failure is logged and absorbed so a bad key can never abort a
//! batch. Tests substitute a stub source at the same seam.

use crate::cache::ResponseCache;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde_json::Value;
use std::env;
use tracing::{debug, error, info, warn};

/// Minute offset between Keepa timestamps and the Unix epoch.
pub const KEEPA_TIME_OFFSET_MINUTES: i64 = 21_564_000;

const KEEPA_ENDPOINT: &str = "https://api.keepa.com/product";
const API_KEY_ENV: &str = "KEEPA_KEY";

pub fn epoch_seconds_from_keepa_min(keepa_min: i64) -> i64 {
    (keepa_min + KEEPA_TIME_OFFSET_MINUTES) * 60
}

pub fn date_from_keepa_min(keepa_min: i64) -> Option<NaiveDate> {
    chrono::DateTime::from_timestamp(epoch_seconds_from_keepa_min(keepa_min), 0)
        .map(|timestamp| timestamp.date_naive())
}

/// Keepa numeric id for a marketplace domain name.
pub fn domain_id(name: &str) -> Option<u8> {
    match name.to_ascii_uppercase().as_str() {
        "COM" | "US" => Some(1),
        "CO.UK" | "UK" | "GB" => Some(2),
        "DE" => Some(3),
        "FR" => Some(4),
        "CO.JP" | "JP" => Some(5),
        "CA" => Some(6),
        "IT" => Some(8),
        "ES" => Some(9),
        "IN" => Some(10),
        "COM.MX" | "MX" => Some(11),
        _ => None,
    }
}

/// One-record-at-a-time source of raw marketplace metadata.
///
/// `fetch_one` returning `None` means "no enrichment data available" for
/// that key; callers pass the row through unchanged rather than retry.
pub trait ProductSource {
    fn fetch_one(&self, asin: &str) -> Option<Value>;

    /// Best-effort batch fetch: unresolvable keys are omitted, never errors.
    fn fetch_many(&self, asins: &[String]) -> Vec<Value> {
        asins.iter().filter_map(|asin| self.fetch_one(asin)).collect()
    }
}

pub struct KeepaClient {
    api_key: Option<String>,
    domain: u8,
    stats_days: u32,
    cache: ResponseCache,
}

impl KeepaClient {
    /// Build a client for `domain`. An unknown domain name is a structural
    /// error; a missing API key is not (the run can still drain the cache).
    pub fn new(cache: ResponseCache, domain: &str, stats_days: u32) -> Result<Self> {
        let domain =
            domain_id(domain).ok_or_else(|| anyhow!("unknown marketplace domain {domain:?}"))?;
        let api_key = env::var(API_KEY_ENV).ok().filter(|key| !key.is_empty());
        if api_key.is_none() {
            error!("{API_KEY_ENV} environment variable not set; only cached ASINs will resolve");
        }
        Ok(Self {
            api_key,
            domain,
            stats_days,
            cache,
        })
    }

    fn query(&self, asin: &str, api_key: &str) -> Result<Value> {
        let url = format!(
            "{KEEPA_ENDPOINT}?key={api_key}&domain={}&asin={asin}&stats={}&history=0",
            self.domain, self.stats_days
        );
        let mut response = ureq::get(&url)
            .call()
            .with_context(|| format!("query keepa for {asin}"))?;
        let body: Value = response
            .body_mut()
            .read_json()
            .with_context(|| format!("parse keepa response for {asin}"))?;
        body.get("products")
            .and_then(Value::as_array)
            .and_then(|products| products.first())
            .cloned()
            .ok_or_else(|| anyhow!("keepa response for {asin} contains no products"))
    }
}

impl ProductSource for KeepaClient {
    fn fetch_one(&self, asin: &str) -> Option<Value> {
        if let Some(record) = self.cache.read(asin) {
            return Some(record);
        }
        let Some(api_key) = self.api_key.as_deref() else {
            debug!(%asin, "no API key and no cached record");
            return None;
        };
        info!(%asin, "fetching from keepa");
        match self.query(asin, api_key) {
            Ok(record) => {
                self.cache.write(asin, &record);
                Some(record)
            }
            Err(err) => {
                warn!(%asin, err = %format!("{err:#}"), "keepa fetch failed; continuing without enrichment");
                None
            }
        }
    }
}
