//! Parallel download engine for course content.
//!
//! This module turns [`DownloadTask`]s into complete, validated files on disk.
//!
//! # Features
//!
//! - Bounded worker pool (3 parallel transfers by default)
//! - Resume of interrupted transfers through `Range` requests
//! - Staging in `<dest>.tmp` with atomic promotion into place
//! - Aggregate bandwidth cap shared by all workers
//! - Integrity validation (size ratio, checksum, media signature, readability)
//! - Retries with exponential backoff on transient HTTP failures
//!
//! # Example
//!
//! ```no_run
//! use thinkific_core::{DownloadManager, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(Settings::from_env()?)?;
//! let ok = manager
//!     .download_file("https://cdn.example/lesson.mp4", "course/lesson.mp4", None, None)
//!     .await;
//! println!("downloaded: {ok}");
//! # Ok(())
//! # }
//! ```

mod constants;
mod error;
mod manager;
mod progress;
pub mod rate_limiter;
mod retry;
mod session;
mod task;
mod validator;

pub use error::{DownloadError, ErrorCategory};
pub use manager::{DEFAULT_CONCURRENCY, DownloadManager, FinalizeOutcome, ManagerError};
pub use progress::{BatchProgress, TaskProgress};
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_RETRY_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error,
};
pub use session::{BROWSER_USER_AGENT, SessionError, TransferSession};
pub use task::{ContentKind, DownloadTask, TaskStatus};
pub use validator::{
    ChecksumAlgorithm, FileValidator, SignatureCheck, SizeVerdict, ValidationIssue,
    ValidationReport, ValidationRequest, is_lock_error,
};

// Note: no module-local Result alias. Use `Result<T, DownloadError>` explicitly
// in function signatures.
