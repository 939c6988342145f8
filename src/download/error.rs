//! Error types for the download module.
//!
//! This module defines structured errors for all download operations,
//! providing context-rich error messages for debugging and user feedback.

use std::path::PathBuf;

use thiserror::Error;

use super::validator::ValidationIssue;

/// Broad error family used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connect, DNS, timeout or HTTP status failures. Retried by the session
    /// and surfaced only after the retry budget is exhausted.
    Network,
    /// The transferred file failed an integrity check. Never retried
    /// automatically; the caller may resubmit the task.
    Validation,
    /// Local file system failures (open, write, rename contention).
    Filesystem,
}

/// Errors that can occur during file downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// File system error during download (create file, write, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A downloaded file failed validation.
    #[error("validation failed for {path}: {issue}")]
    Validation {
        /// The file that failed validation.
        path: PathBuf,
        /// What was wrong with it.
        issue: ValidationIssue,
    },

    /// A rename kept failing after bounded retries (usually a lock held by
    /// another process).
    #[error("could not {operation} {path} after {attempts} attempts: {source}")]
    Filesystem {
        /// Path being moved.
        path: PathBuf,
        /// Short description of the operation, e.g. `promote`.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last IO error observed.
        #[source]
        source: std::io::Error,
    },

    /// The transfer session was closed before the request was issued.
    #[error("transfer session closed; cannot request {url}")]
    SessionClosed {
        /// The URL that was requested.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a validation error.
    pub fn validation(path: impl Into<PathBuf>, issue: ValidationIssue) -> Self {
        Self::Validation {
            path: path.into(),
            issue,
        }
    }

    /// Creates a filesystem contention error.
    pub fn filesystem(
        path: impl Into<PathBuf>,
        operation: &'static str,
        attempts: u32,
        source: std::io::Error,
    ) -> Self {
        Self::Filesystem {
            path: path.into(),
            operation,
            attempts,
            source,
        }
    }

    /// Creates a session-closed error.
    pub fn session_closed(url: impl Into<String>) -> Self {
        Self::SessionClosed { url: url.into() }
    }

    /// Returns the error family this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::InvalidUrl { .. }
            | Self::SessionClosed { .. } => ErrorCategory::Network,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Io { .. } | Self::Filesystem { .. } => ErrorCategory::Filesystem,
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Renders the error together with a next step the user can take.
    #[must_use]
    pub fn actionable_message(&self) -> String {
        let suggestion = match self {
            Self::HttpStatus {
                status: 401 | 403, ..
            } => {
                "The session cookie may have expired; refresh COOKIE_DATA and CLIENT_DATE from a logged-in browser."
            }
            Self::HttpStatus { status: 404, .. } => {
                "The lesson asset no longer exists; re-scrape the course to pick up new links."
            }
            Self::HttpStatus { .. } | Self::Network { .. } | Self::Timeout { .. } => {
                "Check network connectivity, then rerun; partial files are resumed automatically."
            }
            Self::InvalidUrl { .. } => "The scraper produced a malformed link; report the lesson.",
            Self::Validation { .. } => {
                "The file was removed (unless locked); rerun to download it again."
            }
            Self::Io { .. } | Self::Filesystem { .. } => {
                "Close programs that may hold the file open and check free disk space."
            }
            Self::SessionClosed { .. } => "Create a new download manager for further transfers.",
        };
        format!("{self}\n  Suggestion: {suggestion}")
    }
}

// Note: no `From<reqwest::Error>` or `From<std::io::Error>` impls. Every variant
// needs the url or path for context, which the source errors do not carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/lesson.mp4");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/lesson.mp4"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/lesson.mp4", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/lesson.mp4"),
            "Expected URL in: {msg}"
        );
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/lesson.mp4"), io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/lesson.mp4"), "Expected path in: {msg}");
    }

    #[test]
    fn test_download_error_filesystem_display_names_operation() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let error = DownloadError::filesystem("/tmp/lesson.mp4", "promote", 3, io_error);
        let msg = error.to_string();
        assert!(msg.contains("promote"), "Expected operation in: {msg}");
        assert!(msg.contains("3 attempts"), "Expected attempts in: {msg}");
    }

    #[test]
    fn test_download_error_validation_display() {
        let error = DownloadError::validation("/tmp/empty.pdf", ValidationIssue::Empty);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/empty.pdf"), "Expected path in: {msg}");
        assert!(msg.contains("empty"), "Expected reason in: {msg}");
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            DownloadError::timeout("u").category(),
            ErrorCategory::Network
        );
        assert_eq!(
            DownloadError::http_status("u", 503).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            DownloadError::validation("p", ValidationIssue::Empty).category(),
            ErrorCategory::Validation
        );
        let io_error = std::io::Error::other("x");
        assert_eq!(
            DownloadError::io("p", io_error).category(),
            ErrorCategory::Filesystem
        );
    }

    #[test]
    fn test_actionable_message_for_expired_session() {
        let msg =
            DownloadError::http_status("https://school.example/api", 401).actionable_message();
        assert!(msg.contains("COOKIE_DATA"), "got: {msg}");
        assert!(msg.contains("Suggestion:"), "got: {msg}");
    }

    #[test]
    fn test_http_status_code_accessor() {
        assert_eq!(
            DownloadError::http_status("u", 416).http_status_code(),
            Some(416)
        );
        assert_eq!(DownloadError::timeout("u").http_status_code(), None);
    }
}
