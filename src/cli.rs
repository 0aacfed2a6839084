//! CLI argument parsing for the enrichment pipeline.
//!
//! The CLI is intentionally thin: flags mirror config-file fields and are
//! applied as overrides, so the same run can be driven from either.
use crate::config::RunConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "deal-analyzer",
    version,
    about = "Resumable marketplace-enrichment pipeline for inventory spreadsheets",
    after_help = "Examples:\n  deal-analyzer run --input-dir ~/deal_analyzer_input\n  deal-analyzer run --config deal_analyzer.json --output-dir ./results\n  deal-analyzer status --output-dir ./results --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Status(StatusArgs),
}

/// Run (or resume) the pipeline over every matching tab of every input file.
#[derive(Parser, Debug)]
#[command(about = "Run or resume the enrichment pipeline")]
pub struct RunArgs {
    /// Path to the JSON configuration file
    #[arg(long, value_name = "PATH", default_value = "deal_analyzer.json")]
    pub config: PathBuf,

    /// Directory containing input spreadsheets (overrides config)
    #[arg(long, value_name = "DIR")]
    pub input_dir: Option<String>,

    /// Output directory for manifest, staging, cache, and the final report
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<String>,

    /// Regex selecting which tabs to process (overrides config)
    #[arg(long, value_name = "REGEX")]
    pub tab_regex: Option<String>,

    /// Marketplace domain, e.g. CA or US (overrides config)
    #[arg(long, value_name = "NAME")]
    pub domain: Option<String>,

    /// Maximum age in whole days for a cached response to be reused
    #[arg(long, value_name = "DAYS")]
    pub cache_max_age_days: Option<i64>,

    /// Rows between staging/manifest checkpoints
    #[arg(long, value_name = "ROWS")]
    pub checkpoint_interval: Option<usize>,

    /// Disable the on-disk response cache for this run
    #[arg(long)]
    pub no_cache: bool,
}

impl RunArgs {
    /// Fold CLI flags over the loaded config; flags win.
    pub fn apply_overrides(&self, config: &mut RunConfig) {
        if let Some(input_dir) = &self.input_dir {
            config.input_dir = input_dir.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = Some(output_dir.clone());
        }
        if let Some(tab_regex) = &self.tab_regex {
            config.tab_regex = tab_regex.clone();
        }
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(max_age) = self.cache_max_age_days {
            config.cache_max_age_days = max_age;
        }
        if let Some(interval) = self.checkpoint_interval {
            config.checkpoint_interval = interval;
        }
        if self.no_cache {
            config.enable_cache = false;
        }
    }
}

/// Read-only summary of a run directory's manifest.
#[derive(Parser, Debug)]
#[command(about = "Summarize the progress recorded in an output directory")]
pub struct StatusArgs {
    /// Output directory of a previous or in-flight run
    #[arg(long, value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Emit the raw manifest document as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_provided_fields() {
        let args = RunArgs {
            config: PathBuf::from("deal_analyzer.json"),
            input_dir: Some("/data/in".to_string()),
            output_dir: None,
            tab_regex: None,
            domain: Some("US".to_string()),
            cache_max_age_days: None,
            checkpoint_interval: Some(5),
            no_cache: true,
        };
        let mut config = RunConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.input_dir, "/data/in");
        assert_eq!(config.domain, "US");
        assert_eq!(config.checkpoint_interval, 5);
        assert!(!config.enable_cache);
        assert_eq!(config.tab_regex, crate::config::DEFAULT_TAB_REGEX);
    }
}
