use std::fmt;
use std::path::Path;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::CONTENT_RANGE;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::finalize::{file_len, remove_if_present};
use crate::download::constants::CHUNK_SIZE;
use crate::download::error::DownloadError;
use crate::download::progress::TaskProgress;
use crate::download::rate_limiter::RateLimiter;
use crate::download::session::{TransferSession, header_content_length};
use crate::download::task::DownloadTask;

/// Stage of a single task's pipeline, logged on each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TransferPhase {
    Pending,
    Resuming,
    Transferring,
    Finalizing,
    Validated,
    Failed,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Resuming => "resuming",
            Self::Transferring => "transferring",
            Self::Finalizing => "finalizing",
            Self::Validated => "validated",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

pub(super) fn enter_phase(task: &DownloadTask, phase: TransferPhase) {
    debug!(
        url = task.source_url(),
        dest = %task.destination_path().display(),
        %phase,
        "transfer phase"
    );
}

/// Streams the task's source into its staging file, resuming when possible.
///
/// On return the staging file holds everything the server sent. A failure
/// on a non-resumable task removes the staging file.
pub(super) async fn transfer(
    task: &mut DownloadTask,
    session: &TransferSession,
    rate_limiter: &RateLimiter,
    progress: &TaskProgress,
) -> Result<(), DownloadError> {
    let result = transfer_inner(task, session, rate_limiter, progress).await;
    if result.is_err() && !task.resume {
        if let Err(error) = remove_if_present(task.temp_path()).await {
            warn!(path = %task.temp_path().display(), %error, "could not remove staging file");
        }
    }
    result
}

async fn transfer_inner(
    task: &mut DownloadTask,
    session: &TransferSession,
    rate_limiter: &RateLimiter,
    progress: &TaskProgress,
) -> Result<(), DownloadError> {
    let offset = resume_offset(task).await?;
    task.downloaded_bytes = offset;

    if offset > 0 {
        enter_phase(task, TransferPhase::Resuming);
        if task.expected_size.is_some_and(|expected| offset >= expected) {
            debug!(url = task.source_url(), offset, "staging file already complete");
            return Ok(());
        }
    }

    let mut response = match session.get(task.source_url(), Some(offset)).await {
        Ok(response) => response,
        Err(error) if offset > 0 && error.http_status_code() == Some(416) => {
            debug!(
                url = task.source_url(),
                offset,
                "range not satisfiable; staging file is complete"
            );
            return Ok(());
        }
        Err(error) => return Err(error),
    };

    let mut append = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
    if append {
        match content_range_start(&response) {
            Some(start) if start == offset => {}
            Some(0) => {
                info!(
                    url = task.source_url(),
                    offset,
                    "partial response starts at byte 0; restarting"
                );
                append = false;
            }
            start => {
                warn!(
                    url = task.source_url(),
                    offset,
                    ?start,
                    "partial response does not continue the staging file; restarting"
                );
                response = session.get(task.source_url(), None).await?;
                append = false;
            }
        }
    } else if offset > 0 {
        info!(url = task.source_url(), offset, "server ignored range request; restarting");
    }
    if !append {
        task.downloaded_bytes = 0;
    }
    if task.expected_size.is_none() {
        task.expected_size = announced_total(&response, append.then_some(offset));
    }

    enter_phase(task, TransferPhase::Transferring);
    progress.start(task.expected_size, task.downloaded_bytes);

    let temp = task.temp_path().to_path_buf();
    let file = open_staging(&temp, append).await?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(task.source_url())
            } else {
                DownloadError::network(task.source_url(), e)
            }
        })?;

        for slice in chunk.chunks(CHUNK_SIZE) {
            let wait = rate_limiter.acquire(slice.len());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            writer
                .write_all(slice)
                .await
                .map_err(|e| DownloadError::io(&temp, e))?;
            let written = slice.len() as u64;
            task.downloaded_bytes += written;
            progress.advance(written);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(&temp, e))?;

    debug!(
        url = task.source_url(),
        bytes = task.downloaded_bytes,
        resumed = append,
        "transfer complete"
    );
    Ok(())
}

/// Bytes already on disk for this task.
///
/// The staging file wins when present. Otherwise an existing destination is
/// moved into the staging slot and continued.
async fn resume_offset(task: &DownloadTask) -> Result<u64, DownloadError> {
    let temp = task.temp_path();
    if !task.resume {
        remove_if_present(temp)
            .await
            .map_err(|e| DownloadError::io(temp, e))?;
        return Ok(0);
    }

    if let Some(len) = file_len(temp).await? {
        return Ok(len);
    }

    let dest = task.destination_path();
    match file_len(dest).await? {
        Some(len) if len > 0 => {
            tokio::fs::rename(dest, temp)
                .await
                .map_err(|e| DownloadError::io(dest, e))?;
            debug!(path = %dest.display(), bytes = len, "continuing from partial destination");
            Ok(len)
        }
        _ => Ok(0),
    }
}

async fn open_staging(path: &Path, append: bool) -> Result<File, DownloadError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    let mut options = OpenOptions::new();
    if append {
        options.append(true).create(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

/// Full size of the resource: the `Content-Range` total for partial
/// responses, otherwise `Content-Length`.
fn announced_total(response: &reqwest::Response, resumed_from: Option<u64>) -> Option<u64> {
    match resumed_from {
        Some(offset) => content_range(response)
            .and_then(content_range_total)
            .or_else(|| header_content_length(response).map(|len| len + offset)),
        None => content_range(response)
            .and_then(content_range_total)
            .or_else(|| header_content_length(response)),
    }
}

fn content_range(response: &reqwest::Response) -> Option<&str> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
}

fn content_range_start(response: &reqwest::Response) -> Option<u64> {
    content_range(response).and_then(parse_content_range_start)
}

/// Parses the total from `bytes <start>-<end>/<total>`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Parses the start from `bytes <start>-<end>/<total>`.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split_once('-')?.0.trim().parse().ok()
}
