//! Session credentials and download settings.
//!
//! Settings are read from the process environment after an optional `.env`
//! file has been loaded. The authenticated platform session is represented by
//! two opaque values copied from a logged-in browser: the cookie header and
//! the `x-thinkific-client-date` header.
//!
//! A [`Settings`] value is an explicit context object: it is handed to
//! [`DownloadManager::new`](crate::DownloadManager::new) and nothing in this
//! crate reads the environment behind the caller's back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::download::{DEFAULT_CONCURRENCY, DEFAULT_RETRY_ATTEMPTS};

/// Default output directory for downloaded course content.
pub const DEFAULT_OUTPUT_DIR: &str = "./downloads";

/// Default pause between consecutive transfer dispatches (1 second).
pub const DEFAULT_DOWNLOAD_DELAY: Duration = Duration::from_secs(1);

/// Name of the scratch file used to check that the output directory is writable.
const WRITE_CHECK_FILE: &str = ".thinkific-write-check";

/// Errors raised while building [`Settings`].
///
/// These are fatal: they are reported before any download work begins and
/// never travel through the per-task result channel.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `CLIENT_DATE` or `COOKIE_DATA` is missing or empty.
    #[error(
        "session credentials not set: {missing} is empty\n  Suggestion: copy the cookie and x-thinkific-client-date headers from a logged-in browser into .env"
    )]
    MissingCredentials {
        /// Name of the first missing variable.
        missing: &'static str,
    },

    /// A variable holds a value that cannot be parsed.
    #[error("invalid value for {name}: {value:?} ({expected})")]
    InvalidValue {
        /// Environment variable name.
        name: &'static str,
        /// The raw value that failed to parse.
        value: String,
        /// Description of the accepted format.
        expected: &'static str,
    },

    /// The output directory cannot be created or written to.
    #[error("output directory {path} is not writable: {source}")]
    NotWritable {
        /// Directory that failed the write check.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Download settings shared by every transfer of a session.
///
/// The `Debug` output never includes the session cookie.
#[derive(Clone)]
pub struct Settings {
    /// Value of the `x-thinkific-client-date` header.
    pub client_date: String,
    /// Raw `Cookie` header of an authenticated browser session.
    pub cookie_data: String,
    /// Root directory for downloaded content; also swept for stale temp files.
    pub output_dir: PathBuf,
    /// Size of the transfer worker pool.
    pub concurrent_downloads: usize,
    /// Retries on transient HTTP failures (the first attempt is not counted).
    pub retry_attempts: u32,
    /// Aggregate bandwidth cap in MiB/s; `None` disables throttling.
    pub rate_limit_mb_s: Option<f64>,
    /// Pause between consecutive transfer dispatches.
    pub download_delay: Duration,
    /// Run the full validation gate after each transfer.
    pub validate_downloads: bool,
    /// Continue partial transfers instead of restarting them.
    pub resume_partial: bool,
    /// Trace request headers and byte-level progress.
    pub debug: bool,
}

impl Settings {
    /// Creates settings with the given credentials and default tuning.
    #[must_use]
    pub fn new(client_date: impl Into<String>, cookie_data: impl Into<String>) -> Self {
        Self {
            client_date: client_date.into(),
            cookie_data: cookie_data.into(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            concurrent_downloads: DEFAULT_CONCURRENCY,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            rate_limit_mb_s: None,
            download_delay: DEFAULT_DOWNLOAD_DELAY,
            validate_downloads: true,
            resume_partial: true,
            debug: false,
        }
    }

    /// Loads settings from `.env` (if present) and the process environment,
    /// then checks that the output directory is writable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when credentials are missing, a value cannot
    /// be parsed, or the output directory is not writable.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env file"),
            Err(error) => debug!(%error, "no .env file loaded"),
        }

        let settings = Self::from_lookup(|name| std::env::var(name).ok())?;
        settings.ensure_output_dir_writable()?;
        Ok(settings)
    }

    /// Builds settings from an arbitrary variable lookup.
    ///
    /// Unset or empty optional variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] or
    /// [`ConfigError::InvalidValue`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let client_date = var("CLIENT_DATE").ok_or(ConfigError::MissingCredentials {
            missing: "CLIENT_DATE",
        })?;
        let cookie_data = var("COOKIE_DATA").ok_or(ConfigError::MissingCredentials {
            missing: "COOKIE_DATA",
        })?;

        let mut settings = Self::new(client_date, cookie_data);

        if let Some(output_dir) = var("OUTPUT_DIR") {
            settings.output_dir = PathBuf::from(output_dir);
        }
        if let Some(raw) = var("CONCURRENT_DOWNLOADS") {
            settings.concurrent_downloads = parse_number("CONCURRENT_DOWNLOADS", &raw)?;
        }
        if let Some(raw) = var("RETRY_ATTEMPTS") {
            settings.retry_attempts = parse_number("RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("DOWNLOAD_DELAY") {
            let secs: f64 = parse_number("DOWNLOAD_DELAY", &raw)?;
            settings.download_delay =
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidValue {
                    name: "DOWNLOAD_DELAY",
                    value: raw.clone(),
                    expected: "non-negative number of seconds",
                })?;
        }
        if let Some(raw) = var("RATE_LIMIT_MB_S") {
            settings.rate_limit_mb_s = parse_rate_limit(&raw)?;
        }
        if let Some(raw) = var("VALIDATE_DOWNLOADS") {
            settings.validate_downloads = parse_flag(&raw);
        }
        if let Some(raw) = var("RESUME_PARTIAL") {
            settings.resume_partial = parse_flag(&raw);
        }
        if let Some(raw) = var("DEBUG") {
            settings.debug = parse_flag(&raw);
        }

        Ok(settings)
    }

    /// Creates the output directory if needed and verifies it accepts writes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotWritable`] if the directory cannot be created
    /// or a scratch file cannot be written to it.
    pub fn ensure_output_dir_writable(&self) -> Result<(), ConfigError> {
        check_writable(&self.output_dir).map_err(|source| ConfigError::NotWritable {
            path: self.output_dir.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("client_date", &self.client_date)
            .field("cookie_data", &"<redacted>")
            .field("output_dir", &self.output_dir)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .field("retry_attempts", &self.retry_attempts)
            .field("rate_limit_mb_s", &self.rate_limit_mb_s)
            .field("download_delay", &self.download_delay)
            .field("validate_downloads", &self.validate_downloads)
            .field("resume_partial", &self.resume_partial)
            .field("debug", &self.debug)
            .finish()
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scratch = dir.join(WRITE_CHECK_FILE);
    std::fs::write(&scratch, b"")?;
    std::fs::remove_file(&scratch)
}

/// Parses an on/off flag: `1`, `true`, `yes` and `on` enable, anything else disables.
fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
        expected: "a number",
    })
}

/// `0` (or any non-positive value) means unlimited.
fn parse_rate_limit(raw: &str) -> Result<Option<f64>, ConfigError> {
    let value: f64 = parse_number("RATE_LIMIT_MB_S", raw)?;
    if !value.is_finite() {
        return Err(ConfigError::InvalidValue {
            name: "RATE_LIMIT_MB_S",
            value: raw.to_string(),
            expected: "finite MiB/s value",
        });
    }
    Ok((value > 0.0).then_some(value))
}
