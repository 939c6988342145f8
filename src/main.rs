//! CLI entry point for the course downloader.

use std::io::{self, IsTerminal};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use thinkific_core::{DownloadManager, Settings};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Settings are loaded before tracing so DEBUG can raise the default level.
    let settings = Settings::from_env();
    let debug_setting = settings.as_ref().is_ok_and(|s| s.debug);

    // Priority: RUST_LOG env var > quiet flag > verbose flag > DEBUG > info
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level(debug_setting)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mut settings = settings.context("failed to load settings")?;
    args.apply(&mut settings);
    debug!(?settings, "settings resolved");

    let mut tasks = cli::load_manifest(&args.manifest, &settings)?;
    if tasks.is_empty() {
        info!("manifest lists no downloads");
        return Ok(ExitCode::SUCCESS);
    }

    let show_progress = !args.quiet && !args.no_progress && io::stderr().is_terminal();
    let manager = DownloadManager::new(settings)?.with_progress(show_progress);

    info!(
        tasks = tasks.len(),
        concurrency = manager.concurrency(),
        "starting downloads"
    );
    let results = manager.download_files_parallel(&mut tasks).await;
    manager.close().await;

    let failed: Vec<_> = tasks
        .iter()
        .zip(&results)
        .filter(|(_, ok)| !**ok)
        .map(|(task, _)| task)
        .collect();
    for task in &failed {
        warn!(
            dest = %task.destination_path().display(),
            error = task.error.as_deref().unwrap_or("unknown error"),
            "download failed"
        );
    }

    info!(
        completed = results.len() - failed.len(),
        failed = failed.len(),
        total = results.len(),
        "downloads finished"
    );

    Ok(if failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
