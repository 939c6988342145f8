use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::download::error::DownloadError;
use crate::download::task::{ContentKind, DownloadTask};
use crate::download::validator::{
    FileValidator, ValidationIssue, ValidationReport, ValidationRequest,
};

/// What to do with a file that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ValidationMode {
    /// Report only. Used for the pre-transfer existence check.
    Inspect,
    /// Delete the failing file unless another process holds it.
    Enforce,
}

/// Owned copy of what the gate needs, so it can move to a blocking thread.
#[derive(Debug, Clone)]
pub(super) struct ValidationJob {
    path: PathBuf,
    kind: ContentKind,
    expected_size: Option<u64>,
    checksum: Option<String>,
    thorough: bool,
}

impl ValidationJob {
    pub(super) fn for_destination(task: &DownloadTask, thorough: bool) -> Self {
        Self {
            path: task.destination_path().to_path_buf(),
            kind: task.content_kind,
            expected_size: task.expected_size,
            checksum: task.checksum.clone(),
            thorough,
        }
    }

    pub(super) async fn run(self, mode: ValidationMode) -> Result<ValidationReport, DownloadError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || self.run_blocking(mode))
            .await
            .map_err(|join_error| DownloadError::io(path, io::Error::other(join_error)))?
    }

    fn run_blocking(&self, mode: ValidationMode) -> Result<ValidationReport, DownloadError> {
        let request = ValidationRequest {
            kind: self.kind,
            expected_size: self.expected_size,
            checksum: self.checksum.as_deref(),
            thorough: self.thorough,
        };

        match FileValidator::validate(&self.path, &request) {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!(path = %self.path.display(), %warning, "validation warning");
                }
                Ok(report)
            }
            Err(issue) => {
                discard_invalid(&self.path, &issue, mode);
                Err(DownloadError::validation(&self.path, issue))
            }
        }
    }
}

/// Zero-byte files are always removed; other failures only in enforce mode,
/// and never while the file is locked. A malformed expected digest says
/// nothing about the file, so it is kept.
fn discard_invalid(path: &Path, issue: &ValidationIssue, mode: ValidationMode) {
    let remove = match issue {
        ValidationIssue::Missing | ValidationIssue::UnsupportedChecksum { .. } => false,
        ValidationIssue::Empty => true,
        _ if issue.is_locked() => {
            warn!(path = %path.display(), %issue, "file is locked; leaving it in place");
            false
        }
        _ => mode == ValidationMode::Enforce,
    };
    if !remove {
        debug!(path = %path.display(), %issue, ?mode, "validation failed; file kept");
        return;
    }

    match std::fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), %issue, "removed invalid file"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "could not remove invalid file"),
    }
}
