//! CLI argument definitions and task manifest loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use thinkific_core::{DownloadTask, Settings};

/// Download Thinkific course content listed in a task manifest.
///
/// Session credentials (`CLIENT_DATE`, `COOKIE_DATA`) and defaults for every
/// flag are read from the environment or a `.env` file.
#[derive(Parser, Debug)]
#[command(name = "thinkific-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// JSON manifest: an array of `{"url", "dest", "content_type"}` objects
    pub manifest: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum concurrent downloads (1-100) [env: CONCURRENT_DOWNLOADS]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Retries on transient HTTP failures (0-10) [env: RETRY_ATTEMPTS]
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: Option<u8>,

    /// Aggregate bandwidth cap in MiB/s, 0 for unlimited [env: RATE_LIMIT_MB_S]
    #[arg(short = 'l', long)]
    pub rate_limit: Option<f64>,

    /// Only require each file to exist and be non-empty (no size, checksum,
    /// signature or full-read checks)
    #[arg(long)]
    pub no_validate: bool,

    /// Restart partial downloads instead of resuming them
    #[arg(long)]
    pub no_resume: bool,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl Args {
    /// Applies command-line overrides on top of environment settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(concurrency) = self.concurrency {
            settings.concurrent_downloads = usize::from(concurrency);
        }
        if let Some(retries) = self.retries {
            settings.retry_attempts = u32::from(retries);
        }
        if let Some(rate) = self.rate_limit {
            settings.rate_limit_mb_s = (rate.is_finite() && rate > 0.0).then_some(rate);
        }
        if self.no_validate {
            settings.validate_downloads = false;
        }
        if self.no_resume {
            settings.resume_partial = false;
        }
    }

    /// Default log level when `RUST_LOG` is unset.
    pub fn log_level(&self, debug_setting: bool) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 if debug_setting => "debug",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// One manifest entry as produced by the course scraper.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    url: String,
    dest: PathBuf,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    expected_size: Option<u64>,
    #[serde(default)]
    checksum: Option<String>,
}

/// Reads the manifest at `path` into tasks.
///
/// Relative destinations are placed under the configured output directory.
pub fn load_manifest(path: &Path, settings: &Settings) -> Result<Vec<DownloadTask>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse_manifest(&raw, settings)
        .with_context(|| format!("invalid manifest {}", path.display()))
}

fn parse_manifest(raw: &str, settings: &Settings) -> Result<Vec<DownloadTask>> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(raw)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let dest = if entry.dest.is_absolute() {
                entry.dest
            } else {
                settings.output_dir.join(entry.dest)
            };
            DownloadTask::from_triple(entry.url, dest, &entry.content_type)
                .with_expected_size(entry.expected_size)
                .with_checksum(entry.checksum)
                .with_resume(settings.resume_partial)
        })
        .collect())
}
