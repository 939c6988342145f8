//! Backoff policy for failed HTTP requests.
//!
//! [`TransferSession`](super::TransferSession) classifies every failed request
//! with [`classify_error`] and asks [`RetryPolicy::should_retry`] whether to
//! go again. Only CDN hiccups (5xx gateway errors, dropped connections,
//! timeouts) and 429 throttling earn another attempt; an expired session or
//! a missing lesson asset fails at once.
//!
//! ```
//! use thinkific_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::from_retry_attempts(3);
//! let error = DownloadError::http_status("https://school.example/lesson.mp4", 503);
//!
//! let decision = policy.should_retry(classify_error(&error), 1);
//! assert!(matches!(decision, RetryDecision::Retry { attempt: 2, .. }));
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// `RETRY_ATTEMPTS` default: retries on top of the first attempt.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Upper bound of the random delay added to every backoff.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// How a failed request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Gateway errors, resets and timeouts.
    Transient,
    /// 404s, malformed URLs and local failures.
    Permanent,
    /// 401/403: the session cookie no longer works.
    NeedsAuth,
    /// 429 from the platform.
    RateLimited,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then make attempt number `attempt`.
    Retry {
        /// Backoff including jitter.
        delay: Duration,
        /// Number of the upcoming attempt, counting the first one as 1.
        attempt: u32,
    },
    /// Give up and surface the error.
    DoNotRetry {
        /// Logged explanation.
        reason: String,
    },
}

/// Exponential backoff with jitter.
///
/// The n-th retry waits `min(base * multiplier^(n-1), max) + jitter`. The
/// defaults built from `RETRY_ATTEMPTS` start at one second and cap at 32.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Never zero.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retry_attempts(DEFAULT_RETRY_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Builds a policy allowing `max_attempts` requests in total (at least one).
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Default backoff with `retries` extra attempts after the first.
    #[must_use]
    pub fn from_retry_attempts(retries: u32) -> Self {
        Self::new(
            retries.saturating_add(1),
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what follows the failure of attempt number `attempt`.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let refusal = match failure_type {
            FailureType::Permanent => Some("permanent failure".to_string()),
            FailureType::NeedsAuth => {
                Some("session needs re-auth; refresh the cookie and client date".to_string())
            }
            FailureType::Transient | FailureType::RateLimited
                if attempt >= self.max_attempts =>
            {
                Some(format!("attempts exhausted ({})", self.max_attempts))
            }
            FailureType::Transient | FailureType::RateLimited => None,
        };
        if let Some(reason) = refusal {
            debug!(attempt, ?failure_type, %reason, "not retrying");
            return RetryDecision::DoNotRetry { reason };
        }

        let delay = self.calculate_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff before the retry that follows attempt `attempt`, jitter included.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_millis() as f64
            * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64) + Self::calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter() -> Duration {
        let max_ms = MAX_JITTER.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Maps a [`DownloadError`] to its retry treatment.
///
/// The platform's CDN signals transient trouble with 500, 502, 503 and 504;
/// any other status is final. TLS failures are treated as configuration
/// problems and never retried.
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => match *status {
            401 | 403 => FailureType::NeedsAuth,
            429 => FailureType::RateLimited,
            500 | 502 | 503 | 504 => FailureType::Transient,
            _ => FailureType::Permanent,
        },
        DownloadError::Timeout { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } if is_tls_error(source) => FailureType::Permanent,
        DownloadError::Network { .. } => FailureType::Transient,
        DownloadError::InvalidUrl { .. }
        | DownloadError::Io { .. }
        | DownloadError::Validation { .. }
        | DownloadError::Filesystem { .. }
        | DownloadError::SessionClosed { .. } => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_from_retry_attempts_counts_first_attempt() {
        assert_eq!(RetryPolicy::from_retry_attempts(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::from_retry_attempts(3).max_attempts(), 4);
        assert_eq!(
            RetryPolicy::from_retry_attempts(u32::MAX).max_attempts(),
            u32::MAX
        );
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(policy.max_attempts(), 1);
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_calculation_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);

        let first = policy.calculate_delay(1);
        assert!(first >= Duration::from_secs(1));
        assert!(first <= Duration::from_millis(1500));

        let third = policy.calculate_delay(3);
        assert!(third >= Duration::from_secs(4));
        assert!(third <= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_calculation_respects_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delay = policy.calculate_delay(6);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(5500));
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(RetryPolicy::calculate_jitter() <= MAX_JITTER);
        }
    }

    // ==================== Error Classification Tests ====================

    #[test]
    fn test_classify_retryable_statuses() {
        for status in [500, 502, 503, 504] {
            let error = DownloadError::http_status("https://school.example", status);
            assert_eq!(classify_error(&error), FailureType::Transient, "{status}");
        }
        let error = DownloadError::http_status("https://school.example", 429);
        assert_eq!(classify_error(&error), FailureType::RateLimited);
    }

    #[test]
    fn test_classify_auth_statuses() {
        for status in [401, 403] {
            let error = DownloadError::http_status("https://school.example", status);
            assert_eq!(classify_error(&error), FailureType::NeedsAuth, "{status}");
        }
    }

    #[test]
    fn test_classify_other_statuses_permanent() {
        for status in [400, 404, 408, 410, 416, 501, 505] {
            let error = DownloadError::http_status("https://school.example", status);
            assert_eq!(classify_error(&error), FailureType::Permanent, "{status}");
        }
    }

    #[test]
    fn test_classify_timeout_transient() {
        let error = DownloadError::timeout("https://school.example");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_local_errors_permanent() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            classify_error(&DownloadError::io("/path/to/file", io_err)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&DownloadError::invalid_url("not-a-url")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&DownloadError::session_closed("https://school.example")),
            FailureType::Permanent
        );
    }

    // ==================== Should Retry Decision Tests ====================

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("permanent"));
        }
    }

    #[test]
    fn test_should_retry_needs_auth_does_not_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::NeedsAuth, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("auth"));
        }
    }

    #[test]
    fn test_should_retry_transient_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(FailureType::Transient, 1);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 2, .. }));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::from_retry_attempts(2);

        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { .. }
        ));

        let decision = policy.should_retry(FailureType::Transient, 3);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
        if let RetryDecision::DoNotRetry { reason } = decision {
            assert!(reason.contains("exhausted"));
        }
    }

    #[test]
    fn test_no_retries_configured_fails_first_attempt() {
        let policy = RetryPolicy::from_retry_attempts(0);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }
}
