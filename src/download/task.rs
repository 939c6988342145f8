//! The unit of work handled by the download manager.

use std::fmt;
use std::path::{Path, PathBuf};

use super::constants::{BACKUP_SUFFIX, TEMP_SUFFIX};

/// Lifecycle status of a [`DownloadTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// Created, not yet picked up by a worker.
    #[default]
    Pending,
    /// A worker owns the task and is transferring bytes.
    Downloading,
    /// The destination exists and passed validation.
    Completed,
    /// The last attempt failed; see [`DownloadTask::error`].
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Kind of course content behind a task.
///
/// Only selects which validation rules apply; the transfer pipeline treats
/// every kind the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentKind {
    /// Lesson video.
    Video,
    /// Lesson audio.
    Audio,
    /// PDF or other document attachment.
    Document,
    /// Caption / subtitle track.
    Subtitle,
    /// Quiz export.
    Quiz,
    /// Anything the scraper did not tag.
    #[default]
    Other,
}

impl ContentKind {
    /// Maps the scraper's free-form content type tag to a kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "pdf" | "document" | "doc" | "file" => Self::Document,
            "subtitle" | "subtitles" | "caption" | "captions" => Self::Subtitle,
            "quiz" => Self::Quiz,
            _ => Self::Other,
        }
    }

    /// Whether media signature sniffing may apply to this kind.
    #[must_use]
    pub fn is_media(self) -> bool {
        matches!(self, Self::Video | Self::Audio | Self::Other)
    }
}

/// A single transfer: one source URL to one destination path.
///
/// All bytes are staged in [`temp_path`](Self::temp_path) and only reach
/// [`destination_path`](Self::destination_path) through an atomic rename.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Source URL; never changes after construction.
    source_url: String,
    /// Final location of the file.
    destination_path: PathBuf,
    /// Staging file (`destination + ".tmp"`).
    temp_path: PathBuf,
    /// Expected size in bytes, filled from HEAD or Content-Length when absent.
    pub expected_size: Option<u64>,
    /// Expected hex digest, compared case-insensitively after transfer.
    pub checksum: Option<String>,
    /// Continue partial content instead of restarting.
    pub resume: bool,
    /// Content kind, used to pick validation rules.
    pub content_kind: ContentKind,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Last failure reason.
    pub error: Option<String>,
    /// Bytes on disk for the current attempt.
    pub downloaded_bytes: u64,
}

impl DownloadTask {
    /// Creates a pending task with resume enabled and no size or checksum hint.
    pub fn new(source_url: impl Into<String>, destination_path: impl Into<PathBuf>) -> Self {
        let destination_path = destination_path.into();
        let temp_path = sibling_with_suffix(&destination_path, TEMP_SUFFIX);
        Self {
            source_url: source_url.into(),
            destination_path,
            temp_path,
            expected_size: None,
            checksum: None,
            resume: true,
            content_kind: ContentKind::Other,
            status: TaskStatus::Pending,
            error: None,
            downloaded_bytes: 0,
        }
    }

    /// Creates a task from a scraper triple.
    pub fn from_triple(
        source_url: impl Into<String>,
        destination_path: impl Into<PathBuf>,
        content_type: &str,
    ) -> Self {
        Self::new(source_url, destination_path)
            .with_content_kind(ContentKind::from_tag(content_type))
    }

    /// Sets the expected size.
    #[must_use]
    pub fn with_expected_size(mut self, expected_size: Option<u64>) -> Self {
        self.expected_size = expected_size;
        self
    }

    /// Sets the expected checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    /// Enables or disables resume.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets the content kind.
    #[must_use]
    pub fn with_content_kind(mut self, content_kind: ContentKind) -> Self {
        self.content_kind = content_kind;
        self
    }

    /// Returns the source URL.
    #[must_use]
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Returns the destination path.
    #[must_use]
    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    /// Returns the staging path.
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Short display name (the destination file name).
    #[must_use]
    pub fn display_name(&self) -> String {
        self.destination_path
            .file_name()
            .map_or_else(|| self.source_url.clone(), |name| name.to_string_lossy().into_owned())
    }

    pub(crate) fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.error = None;
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.error = None;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(reason.into());
    }
}

/// Appends `suffix` to the full file name (`lesson.mp4` -> `lesson.mp4.tmp`).
pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Backup location used while a destination is being replaced.
pub(crate) fn backup_path(destination: &Path) -> PathBuf {
    sibling_with_suffix(destination, BACKUP_SUFFIX)
}
