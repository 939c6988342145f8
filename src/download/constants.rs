//! Constants for the download module (timeouts, chunking, finalize and validation policy).

use std::time::Duration;

/// HTTP connect timeout (15 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Idle read timeout for GET bodies (60 seconds); a transfer may run longer
/// as long as bytes keep arriving.
pub const GET_TIMEOUT_SECS: u64 = 60;

/// Total timeout for HEAD requests (30 seconds).
pub const HEAD_TIMEOUT_SECS: u64 = 30;

/// Maximum idle pooled connections kept per host.
pub const POOL_MAX_IDLE_PER_HOST: usize = 20;

/// Size of each rate-limited write slice (8 KiB).
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Suffix appended to the destination path for the staging file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Suffix appended to the destination path while it is being replaced.
pub const BACKUP_SUFFIX: &str = ".backup";

/// Number of rename attempts during finalize.
pub const RENAME_ATTEMPTS: u32 = 3;

/// Pause between rename attempts.
pub const RENAME_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A staged file replaces an existing destination only when larger than
/// `destination * REPLACE_MARGIN_NUM / REPLACE_MARGIN_DEN` (110%).
pub const REPLACE_MARGIN_NUM: u64 = 11;

/// See [`REPLACE_MARGIN_NUM`].
pub const REPLACE_MARGIN_DEN: u64 = 10;

/// Files smaller than this ratio of the expected size are incomplete.
pub const MIN_COMPLETE_RATIO: f64 = 0.95;

/// Files larger than this ratio of the expected size trigger a warning.
pub const MAX_OVERSIZE_RATIO: f64 = 1.10;

/// Media files below this size get a soft warning for unknown signatures (1 MiB).
pub const SMALL_MEDIA_THRESHOLD: u64 = 1024 * 1024;

/// Bytes inspected for media container signatures.
pub const SIGNATURE_HEADER_LEN: usize = 16;

/// Bytes read from the end of a file by the truncation check (1 KiB).
pub const TAIL_CHECK_LEN: u64 = 1024;

/// Staging files untouched for longer than this are swept on close (1 hour).
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Maximum Retry-After value honored (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
