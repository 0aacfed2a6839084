//! deal-analyzer: resumable marketplace enrichment for inventory
//! spreadsheets.
//!
//! `run` walks every matching tab of every input workbook, enriches each
//! row with cached-or-fetched Keepa metadata, checkpoints progress so an
//! interrupted run resumes where it stopped, and stitches the staged tabs
//! into one report workbook. `status` summarizes a run directory without
//! touching it.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod cache;
mod cli;
mod config;
mod enrich;
mod keepa;
mod manifest;
mod sheets;
mod staging;
mod util;
mod workflow;

fn main() -> Result<()> {
    let args = cli::RootArgs::parse();
    match args.command {
        cli::Command::Run(run) => cmd_run(&run),
        cli::Command::Status(status) => cmd_status(&status),
    }
}

fn cmd_run(args: &cli::RunArgs) -> Result<()> {
    let mut config = config::load(&args.config)?;
    args.apply_overrides(&mut config);
    config::validate(&config)?;

    // Structural checks happen before any on-disk state is created, so a
    // typo'd input directory can never dirty an existing run.
    let input_files = sheets::discover_input_files(&config.input_dir)?;
    if input_files.is_empty() {
        return Err(anyhow!(
            "no .xlsx or .xls files found in {}",
            config.input_dir
        ));
    }

    let output_dir = resolve_output_dir(&config, &input_files);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("create output directory {}", output_dir.display()))?;
    init_logging(&output_dir.join(&config.log_name))?;

    info!(
        config = %args.config.display(),
        domain = %config.domain,
        tab_regex = %config.tab_regex,
        checkpoint_interval = config.checkpoint_interval,
        cache = config.enable_cache,
        "starting run"
    );
    for file in &input_files {
        info!(input = %file.display(), "discovered input file");
    }
    info!(output_dir = %output_dir.display(), "using output directory");

    let cache = cache::ResponseCache::new(
        output_dir.join("cache"),
        config.cache_max_age_days,
        config.enable_cache,
    );
    cache.ensure_dir();
    let client = keepa::KeepaClient::new(cache, &config.domain, config.lookback_days)?;
    let mut driver = workflow::Driver::new(&config, &client, &output_dir)?;
    let report = driver.run(&input_files)?;
    info!(report = %report.display(), "wrote report");
    Ok(())
}

/// Read-only view of a run directory; never creates or mutates state.
fn cmd_status(args: &cli::StatusArgs) -> Result<()> {
    let path = args.output_dir.join(manifest::STATE_FILE);
    if !path.is_file() {
        return Err(anyhow!("no run found in {}", args.output_dir.display()));
    }
    let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let data: manifest::Manifest =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("status:  {}", data.status);
    println!("created: {}", data.creation_time);
    for file in &data.input_files {
        let tabs = data
            .completed_tabs
            .get(file)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        println!("{file}: {} tab(s) complete", tabs.len());
        for tab in tabs {
            println!("  {tab}");
        }
    }
    if let (Some(file), Some(tab)) = (&data.current_input_file, &data.current_tab) {
        match &data.current_asin {
            Some(asin) => println!("in flight: {tab} of {file}, last key {asin}"),
            None => println!("in flight: {tab} of {file}"),
        }
    }
    for output in &data.output_files {
        println!("report: {output}");
    }
    Ok(())
}

/// Configured output directory, or one named after the input files'
/// joined stems under the current directory.
fn resolve_output_dir(config: &config::RunConfig, input_files: &[PathBuf]) -> PathBuf {
    if let Some(dir) = &config.output_dir {
        return sheets::expand_tilde(dir);
    }
    let joined: Vec<String> = input_files.iter().map(|f| util::file_stem_string(f)).collect();
    PathBuf::from(joined.join("_"))
}

/// One subscriber for the whole run: human-readable stderr plus a plain
/// append-only logfile inside the output directory.
fn init_logging(log_path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .init();
    Ok(())
}
