//! Download manager for parallel, resumable, validated transfers.
//!
//! [`DownloadManager`] owns the worker pool, the shared bandwidth limiter and
//! the authenticated [`TransferSession`]. Every task runs the same pipeline:
//!
//! 1. Skip when a valid destination already exists (no network traffic).
//! 2. Look up the expected size with HEAD when it is unknown.
//! 3. Stream into `<dest>.tmp`, resuming with a `Range` request.
//! 4. Promote the staging file into place.
//! 5. Validate the destination, deleting it when it is corrupt.
//!
//! # Concurrency Model
//!
//! - Each transfer runs in its own Tokio task
//! - A semaphore permit is acquired before a task is spawned
//! - Permits are released automatically when transfers complete (RAII)
//! - Results are stored by input position, whatever the completion order
//!
//! # Example
//!
//! ```no_run
//! use thinkific_core::{DownloadManager, DownloadTask, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_env()?;
//! let manager = DownloadManager::new(settings)?;
//! let mut tasks = vec![
//!     DownloadTask::from_triple("https://cdn.example/1.mp4", "course/01/lesson.mp4", "video"),
//!     DownloadTask::from_triple("https://cdn.example/notes.pdf", "course/01/notes.pdf", "pdf"),
//! ];
//! let results = manager.download_files_parallel(&mut tasks).await;
//! println!("{} of {} succeeded", results.iter().filter(|ok| **ok).count(), results.len());
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

mod cleanup;
mod finalize;
mod transfer;
mod validation;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

pub use finalize::FinalizeOutcome;
use transfer::{TransferPhase, enter_phase};
use validation::{ValidationJob, ValidationMode};

use super::constants::STALE_TEMP_AGE;
use super::error::DownloadError;
use super::progress::{BatchProgress, TaskProgress};
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use super::session::{SessionError, TransferSession};
use super::task::DownloadTask;
use crate::config::Settings;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Default number of parallel transfers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Error type for download manager construction.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The HTTP session could not be built.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Parallel download engine bound to one authenticated session.
#[derive(Debug)]
pub struct DownloadManager {
    settings: Settings,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    worker: Worker,
    progress: BatchProgress,
    closed: AtomicBool,
}

/// Everything a spawned transfer needs; cheap to clone into each task.
#[derive(Debug, Clone)]
struct Worker {
    session: TransferSession,
    rate_limiter: Arc<RateLimiter>,
    thorough: bool,
}

impl DownloadManager {
    /// Creates a manager from `settings`.
    ///
    /// Progress bars are hidden; enable them with
    /// [`with_progress`](Self::with_progress).
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidConcurrency`] when
    /// `concurrent_downloads` is outside 1..=100, or
    /// [`ManagerError::Session`] when the HTTP client cannot be built.
    #[instrument(level = "debug", skip(settings))]
    pub fn new(settings: Settings) -> Result<Self, ManagerError> {
        let concurrency = settings.concurrent_downloads;
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(ManagerError::InvalidConcurrency { value: concurrency });
        }

        let session = TransferSession::new(&settings)?;
        let rate_limiter = Arc::new(RateLimiter::from_mb_per_sec(settings.rate_limit_mb_s));

        debug!(
            concurrency,
            max_attempts = session.retry_policy().max_attempts(),
            rate_limit_bytes = rate_limiter.capacity(),
            validate = settings.validate_downloads,
            resume = settings.resume_partial,
            "creating download manager"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            worker: Worker {
                session,
                rate_limiter,
                thorough: settings.validate_downloads,
            },
            progress: BatchProgress::new(false),
            settings,
            closed: AtomicBool::new(false),
        })
    }

    /// Draws progress bars on stderr when `enabled`.
    #[must_use]
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = BatchProgress::new(enabled);
        self
    }

    /// Replaces the HTTP retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.worker.session = self.worker.session.with_retry_policy(retry_policy);
        self
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the settings this manager was built with.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Downloads one file and reports whether `dest` now holds a valid copy.
    ///
    /// An existing valid destination is accepted without any request.
    #[instrument(skip_all, fields(url = %url, dest = %dest.as_ref().display()))]
    pub async fn download_file(
        &self,
        url: &str,
        dest: impl AsRef<std::path::Path>,
        expected_size: Option<u64>,
        checksum: Option<String>,
    ) -> bool {
        let mut task = DownloadTask::new(url, PathBuf::from(dest.as_ref()))
            .with_expected_size(expected_size)
            .with_checksum(checksum)
            .with_resume(self.settings.resume_partial);

        if self.worker.existing_valid(&task).await {
            info!("file already exists and is valid");
            task.mark_completed();
            return true;
        }

        let Ok(_permit) = self.semaphore.acquire().await else {
            warn!("download manager is closed");
            return false;
        };
        let progress = self.progress.queued(&task.display_name());
        self.worker.run(&mut task, &progress).await
    }

    /// Downloads every task and returns one result per task, in input order.
    ///
    /// Tasks are updated in place with their final status and error.
    pub async fn download_files_parallel(&self, tasks: &mut [DownloadTask]) -> Vec<bool> {
        self.download_files_parallel_with_callback(tasks, |_, _| {})
            .await
    }

    /// Like [`download_files_parallel`](Self::download_files_parallel), calling
    /// `on_complete` for each task as soon as its outcome is known.
    ///
    /// One task failing, or its worker panicking, never affects the others.
    #[instrument(skip_all, fields(tasks = tasks.len(), concurrency = self.concurrency))]
    pub async fn download_files_parallel_with_callback<F>(
        &self,
        tasks: &mut [DownloadTask],
        mut on_complete: F,
    ) -> Vec<bool>
    where
        F: FnMut(&DownloadTask, bool),
    {
        let mut results = vec![false; tasks.len()];
        if tasks.is_empty() {
            return results;
        }

        info!("starting batch");
        let bars: Vec<TaskProgress> = tasks
            .iter()
            .map(|task| self.progress.queued(&task.display_name()))
            .collect();

        let mut running: FuturesUnordered<BoxFuture<'static, Joined>> = FuturesUnordered::new();
        let mut dispatched = 0usize;

        for index in 0..tasks.len() {
            if self.worker.existing_valid(&tasks[index]).await {
                debug!(url = tasks[index].source_url(), "already downloaded; skipping");
                tasks[index].mark_completed();
                bars[index].finish(true, "already downloaded");
                results[index] = true;
                on_complete(&tasks[index], true);
                continue;
            }

            if dispatched > 0 && !self.settings.download_delay.is_zero() {
                tokio::time::sleep(self.settings.download_delay).await;
            }

            // Keep reporting completions while waiting for a free worker.
            let permit = loop {
                tokio::select! {
                    biased;
                    Some((done, joined)) = running.next(), if !running.is_empty() => {
                        record_outcome(tasks, &mut results, &mut on_complete, done, joined);
                    }
                    permit = Arc::clone(&self.semaphore).acquire_owned() => break permit,
                }
            };
            let Ok(permit) = permit else {
                warn!(url = tasks[index].source_url(), "download manager is closed");
                tasks[index].mark_failed("download manager is closed");
                bars[index].finish(false, "not started");
                on_complete(&tasks[index], false);
                continue;
            };

            let worker = self.worker.clone();
            let mut task = tasks[index].clone();
            let bar = bars[index].clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let ok = worker.run(&mut task, &bar).await;
                (task, ok)
            });
            running.push(async move { (index, handle.await) }.boxed());
            dispatched += 1;
        }

        while let Some((done, joined)) = running.next().await {
            record_outcome(tasks, &mut results, &mut on_complete, done, joined);
        }

        let succeeded = results.iter().filter(|ok| **ok).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            "batch complete"
        );
        results
    }

    /// Waits for in-flight transfers, closes the session and removes staging
    /// files older than one hour under the output directory. Idempotent.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            all.forget();
        }
        self.semaphore.close();
        self.worker.session.close();

        let root = self.settings.output_dir.clone();
        let sweep = tokio::task::spawn_blocking(move || {
            cleanup::sweep_stale_temp_files(&root, STALE_TEMP_AGE)
        })
        .await;
        match sweep {
            Ok(0) => debug!("no stale temp files"),
            Ok(removed) => info!(removed, "removed stale temp files"),
            Err(error) => warn!(%error, "temp file sweep failed"),
        }
    }
}

/// A finished worker: input index plus the updated task and its result.
type Joined = (usize, Result<(DownloadTask, bool), JoinError>);

fn record_outcome<F>(
    tasks: &mut [DownloadTask],
    results: &mut [bool],
    on_complete: &mut F,
    index: usize,
    joined: Result<(DownloadTask, bool), JoinError>,
) where
    F: FnMut(&DownloadTask, bool),
{
    let ok = match joined {
        Ok((task, ok)) => {
            tasks[index] = task;
            ok
        }
        Err(join_error) => {
            error!(
                url = tasks[index].source_url(),
                error = %join_error,
                "download worker panicked"
            );
            tasks[index].mark_failed(format!("worker panicked: {join_error}"));
            false
        }
    };
    results[index] = ok;
    on_complete(&tasks[index], ok);
}

impl Worker {
    /// Non-destructive check for a complete destination. A staging file
    /// next to it means an earlier transfer was interrupted, so the task
    /// must run.
    async fn existing_valid(&self, task: &DownloadTask) -> bool {
        if tokio::fs::try_exists(task.temp_path()).await.unwrap_or(false) {
            return false;
        }
        if !tokio::fs::try_exists(task.destination_path())
            .await
            .unwrap_or(false)
        {
            return false;
        }
        ValidationJob::for_destination(task, self.thorough)
            .run(ValidationMode::Inspect)
            .await
            .is_ok()
    }

    async fn run(&self, task: &mut DownloadTask, progress: &TaskProgress) -> bool {
        enter_phase(task, TransferPhase::Pending);
        task.mark_downloading();
        match self.pipeline(task, progress).await {
            Ok(outcome) => {
                enter_phase(task, TransferPhase::Validated);
                info!(
                    url = task.source_url(),
                    dest = %task.destination_path().display(),
                    ?outcome,
                    "download complete"
                );
                task.mark_completed();
                progress.finish(true, "");
                true
            }
            Err(error) => {
                enter_phase(task, TransferPhase::Failed);
                warn!(
                    url = task.source_url(),
                    dest = %task.destination_path().display(),
                    category = ?error.category(),
                    "{}",
                    error.actionable_message()
                );
                task.mark_failed(error.to_string());
                progress.finish(false, &error.to_string());
                false
            }
        }
    }

    async fn pipeline(
        &self,
        task: &mut DownloadTask,
        progress: &TaskProgress,
    ) -> Result<FinalizeOutcome, DownloadError> {
        if task.expected_size.is_none() {
            task.expected_size = self.session.content_length(task.source_url()).await;
        }

        transfer::transfer(task, &self.session, &self.rate_limiter, progress).await?;

        enter_phase(task, TransferPhase::Finalizing);
        let outcome = finalize::finalize(task.temp_path(), task.destination_path()).await?;

        ValidationJob::for_destination(task, self.thorough)
            .run(ValidationMode::Enforce)
            .await?;
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn test_settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::new("2024-05-01", "_session=test");
        settings.output_dir = dir.path().to_path_buf();
        settings.download_delay = Duration::ZERO;
        settings.retry_attempts = 0;
        settings
    }

    #[test]
    fn test_manager_rejects_out_of_range_concurrency() {
        let dir = TempDir::new().unwrap();
        for value in [0, 101] {
            let mut settings = test_settings(&dir);
            settings.concurrent_downloads = value;
            assert!(matches!(
                DownloadManager::new(settings),
                Err(ManagerError::InvalidConcurrency { value: v }) if v == value
            ));
        }
    }

    #[test]
    fn test_manager_accepts_bounds() {
        let dir = TempDir::new().unwrap();
        for value in [1, DEFAULT_CONCURRENCY, 100] {
            let mut settings = test_settings(&dir);
            settings.concurrent_downloads = value;
            assert_eq!(DownloadManager::new(settings).unwrap().concurrency(), value);
        }
    }

    #[test]
    fn test_manager_error_display() {
        let msg = ManagerError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("100"));
    }

    #[tokio::test]
    async fn test_download_file_writes_destination_without_leftovers() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/notes.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 body"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_settings(&dir)).unwrap();
        let dest = dir.path().join("course").join("notes.pdf");

        let ok = manager
            .download_file(&format!("{}/notes.pdf", server.uri()), &dest, None, None)
            .await;

        assert!(ok);
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.7 body");
        assert!(!dir.path().join("course").join("notes.pdf.tmp").exists());
        assert!(!dir.path().join("course").join("notes.pdf.backup").exists());
    }

    #[tokio::test]
    async fn test_callback_sees_every_task_once() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/ok.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_settings(&dir)).unwrap();
        let mut tasks: Vec<DownloadTask> = (0..4)
            .map(|i| {
                DownloadTask::new(
                    format!("{}/ok.txt", server.uri()),
                    dir.path().join(format!("{i}.txt")),
                )
            })
            .collect();

        let mut seen = Vec::new();
        let results = manager
            .download_files_parallel_with_callback(&mut tasks, |task, ok| {
                seen.push((task.display_name(), ok));
            })
            .await;

        assert_eq!(results, vec![true; 4]);
        seen.sort();
        assert_eq!(
            seen,
            (0..4).map(|i| (format!("{i}.txt"), true)).collect::<Vec<_>>()
        );
        assert!(tasks.iter().all(|t| t.status == crate::TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_closed_manager_refuses_work_and_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_settings(&dir)).unwrap();
        manager.close().await;
        manager.close().await;

        let ok = manager
            .download_file(
                "https://school.example/lesson.mp4",
                dir.path().join("lesson.mp4"),
                None,
                None,
            )
            .await;
        assert!(!ok);

        let mut tasks = vec![DownloadTask::new(
            "https://school.example/lesson.mp4",
            dir.path().join("lesson.mp4"),
        )];
        let results = manager.download_files_parallel(&mut tasks).await;
        assert_eq!(results, vec![false]);
        assert_eq!(tasks[0].status, crate::TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty_results() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_settings(&dir)).unwrap();
        let results = manager.download_files_parallel(&mut []).await;
        assert!(results.is_empty());
    }
}
