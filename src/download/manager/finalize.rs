use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::download::constants::{
    RENAME_ATTEMPTS, RENAME_RETRY_DELAY, REPLACE_MARGIN_DEN, REPLACE_MARGIN_NUM,
};
use crate::download::error::DownloadError;
use crate::download::task::backup_path;

/// What finalize did with the staging file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No staging file existed.
    NothingToPromote,
    /// The staging file became the destination; nothing was there before.
    Promoted,
    /// The staging file replaced a smaller destination.
    Replaced,
    /// The destination was kept and the staging file discarded.
    KeptExisting,
}

/// Moves `temp` into place at `dest`.
///
/// A staged file replaces an existing destination only when it is more than
/// 10% larger. The old destination is parked at `<dest>.backup` during the
/// swap and restored if the rename keeps failing.
pub(super) async fn finalize(temp: &Path, dest: &Path) -> Result<FinalizeOutcome, DownloadError> {
    let Some(temp_len) = file_len(temp).await? else {
        debug!(path = %temp.display(), "no staging file to finalize");
        return Ok(FinalizeOutcome::NothingToPromote);
    };

    let Some(dest_len) = file_len(dest).await? else {
        rename_with_retry(temp, dest, "promote").await?;
        info!(path = %dest.display(), bytes = temp_len, "promoted download");
        return Ok(FinalizeOutcome::Promoted);
    };

    if !should_replace(temp_len, dest_len) {
        debug!(
            path = %dest.display(),
            temp_bytes = temp_len,
            dest_bytes = dest_len,
            "keeping existing file; discarding staging file"
        );
        remove_if_present(temp)
            .await
            .map_err(|e| DownloadError::io(temp, e))?;
        return Ok(FinalizeOutcome::KeptExisting);
    }

    replace_with_backup(temp, dest).await?;
    info!(
        path = %dest.display(),
        old_bytes = dest_len,
        new_bytes = temp_len,
        "replaced smaller existing file"
    );
    Ok(FinalizeOutcome::Replaced)
}

/// Swaps `temp` into `dest`, parking the old file at `<dest>.backup` and
/// putting it back when the swap fails.
async fn replace_with_backup(temp: &Path, dest: &Path) -> Result<(), DownloadError> {
    let backup = backup_path(dest);
    rename_with_retry(dest, &backup, "back up").await?;

    if let Err(error) = rename_with_retry(temp, dest, "replace").await {
        match tokio::fs::rename(&backup, dest).await {
            Ok(()) => warn!(path = %dest.display(), "replace failed; restored previous file"),
            Err(restore) => warn!(
                path = %dest.display(),
                backup = %backup.display(),
                error = %restore,
                "replace failed and backup could not be restored"
            ),
        }
        return Err(error);
    }

    if let Err(error) = remove_if_present(&backup).await {
        warn!(path = %backup.display(), %error, "could not remove backup");
    }
    Ok(())
}

/// `temp > dest * 1.1`, in integer arithmetic.
fn should_replace(temp_len: u64, dest_len: u64) -> bool {
    u128::from(temp_len) * u128::from(REPLACE_MARGIN_DEN)
        > u128::from(dest_len) * u128::from(REPLACE_MARGIN_NUM)
}

async fn rename_with_retry(
    from: &Path,
    to: &Path,
    operation: &'static str,
) -> Result<(), DownloadError> {
    let mut attempt = 1;
    loop {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt < RENAME_ATTEMPTS => {
                debug!(
                    from = %from.display(),
                    to = %to.display(),
                    attempt,
                    %error,
                    "rename failed, retrying"
                );
                tokio::time::sleep(RENAME_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(DownloadError::filesystem(from, operation, attempt, error));
            }
        }
    }
}

pub(super) async fn file_len(path: &Path) -> Result<Option<u64>, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(DownloadError::io(path, error)),
    }
}

pub(super) async fn remove_if_present(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
