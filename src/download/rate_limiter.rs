//! Aggregate bandwidth limiting for download transfers.
//!
//! This module provides the [`RateLimiter`] struct, a token bucket shared by
//! every transfer worker. Each worker asks for permission to write a chunk of
//! bytes and sleeps for the returned duration before writing it. Because the
//! bucket is shared, the cap applies to the combined throughput of all
//! workers, not to each worker on its own.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use thinkific_core::download::RateLimiter;
//!
//! # async fn example() {
//! // 2 MiB/s across all workers
//! let limiter = Arc::new(RateLimiter::from_mb_per_sec(Some(2.0)));
//!
//! let wait = limiter.acquire(8192);
//! if !wait.is_zero() {
//!     tokio::time::sleep(wait).await;
//! }
//! // ... write the chunk
//! # }
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use super::constants::MAX_RETRY_AFTER;

/// Bytes per MiB, the unit of the `RATE_LIMIT_MB_S` setting.
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Token-bucket limiter for aggregate transfer speed.
///
/// The bucket holds at most one second worth of bytes. Refill happens lazily
/// on each [`acquire`](Self::acquire) call, proportional to the wall-clock
/// time elapsed since the previous refill.
///
/// # Thread Safety
///
/// `RateLimiter` is `Send + Sync`. The refill-and-debit sequence runs under a
/// mutex and never awaits, so it is safe to call from any worker task.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; `None` disables limiting.
    capacity: Option<f64>,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Available bytes. Can go negative while callers are waiting on
    /// previously reserved budget.
    tokens: f64,
    /// Point in time the token count refers to. Pushed into the future when a
    /// caller is told to wait, so the bucket stays drained for that duration.
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given capacity in bytes per second.
    ///
    /// A capacity of zero creates an unlimited limiter. The bucket starts
    /// empty, so the very first bytes are already throttled.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        debug!("creating rate limiter");
        #[allow(clippy::cast_precision_loss)]
        let capacity = bytes_per_sec as f64;
        Self {
            capacity: Some(capacity),
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a limiter from the `RATE_LIMIT_MB_S` setting.
    ///
    /// `None`, zero, negative and non-finite values disable limiting.
    #[must_use]
    pub fn from_mb_per_sec(mb_per_sec: Option<f64>) -> Self {
        match mb_per_sec {
            Some(rate) if rate.is_finite() && rate > 0.0 => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let bytes = (rate * BYTES_PER_MIB).round() as u64;
                Self::new(bytes)
            }
            _ => Self::unlimited(),
        }
    }

    /// Creates a limiter that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            capacity: None,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns whether limiting is disabled.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.capacity.is_none()
    }

    /// Returns the configured capacity in bytes per second.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn capacity(&self) -> Option<u64> {
        self.capacity.map(|capacity| capacity as u64)
    }

    /// Reserves `n_bytes` of transfer budget and returns how long the caller
    /// must sleep before writing them.
    ///
    /// Returns [`Duration::ZERO`] when the bucket covers the request or when
    /// limiting is disabled.
    pub fn acquire(&self, n_bytes: usize) -> Duration {
        self.acquire_at(n_bytes, Instant::now())
    }

    fn acquire_at(&self, n_bytes: usize, now: Instant) -> Duration {
        let Some(capacity) = self.capacity else {
            return Duration::ZERO;
        };
        #[allow(clippy::cast_precision_loss)]
        let wanted = n_bytes as f64;

        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);

        // Elapsed time is negative while earlier callers are still waiting on
        // budget they reserved; the resulting debt is added to this wait.
        let elapsed = if now >= bucket.last_refill {
            now.duration_since(bucket.last_refill).as_secs_f64()
        } else {
            -bucket.last_refill.duration_since(now).as_secs_f64()
        };
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            return Duration::ZERO;
        }

        let wait_secs = (wanted - bucket.tokens) / capacity;
        let wait = Duration::from_secs_f64(wait_secs);
        bucket.tokens = 0.0;
        bucket.last_refill = now + wait;
        wait
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use thinkific_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
        Ok(duration) => Some(duration),
        // Date is in the past
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn approx_secs(duration: Duration, expected: f64) -> bool {
        (duration.as_secs_f64() - expected).abs() < 1e-6
    }

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        assert!(limiter.is_unlimited());
        for _ in 0..1000 {
            assert_eq!(limiter.acquire(1 << 20), Duration::ZERO);
        }
    }

    #[test]
    fn test_from_mb_per_sec_none_or_zero_is_unlimited() {
        assert!(RateLimiter::from_mb_per_sec(None).is_unlimited());
        assert!(RateLimiter::from_mb_per_sec(Some(0.0)).is_unlimited());
        assert!(RateLimiter::from_mb_per_sec(Some(-1.0)).is_unlimited());
        assert!(RateLimiter::from_mb_per_sec(Some(f64::NAN)).is_unlimited());
        assert!(RateLimiter::new(0).is_unlimited());
    }

    #[test]
    fn test_from_mb_per_sec_converts_to_bytes() {
        let limiter = RateLimiter::from_mb_per_sec(Some(1.0));
        assert_eq!(limiter.capacity(), Some(MIB));

        let limiter = RateLimiter::from_mb_per_sec(Some(0.5));
        assert_eq!(limiter.capacity(), Some(MIB / 2));
    }

    #[test]
    fn test_empty_bucket_charges_full_request() {
        let limiter = RateLimiter::new(1000);
        let start = limiter.bucket.lock().unwrap().last_refill;

        let wait = limiter.acquire_at(500, start);
        assert!(approx_secs(wait, 0.5), "got {wait:?}");
    }

    #[test]
    fn test_refill_covers_request_without_waiting() {
        let limiter = RateLimiter::new(1000);
        let start = limiter.bucket.lock().unwrap().last_refill;

        let wait = limiter.acquire_at(400, start + Duration::from_millis(500));
        assert_eq!(wait, Duration::ZERO);

        // 100 tokens remain; 300 more are needed
        let wait = limiter.acquire_at(400, start + Duration::from_millis(500));
        assert!(approx_secs(wait, 0.3), "got {wait:?}");
    }

    #[test]
    fn test_burst_capped_at_one_second_of_capacity() {
        let limiter = RateLimiter::new(1000);
        let start = limiter.bucket.lock().unwrap().last_refill;

        // A long idle period refills at most `capacity` tokens
        let later = start + Duration::from_secs(60);
        assert_eq!(limiter.acquire_at(1000, later), Duration::ZERO);

        let wait = limiter.acquire_at(1, later);
        assert!(wait > Duration::ZERO, "burst must not exceed capacity");
    }

    #[test]
    fn test_back_to_back_callers_accumulate_waits() {
        let limiter = RateLimiter::new(1000);
        let start = limiter.bucket.lock().unwrap().last_refill;

        let first = limiter.acquire_at(1000, start);
        let second = limiter.acquire_at(1000, start);
        assert!(approx_secs(first, 1.0), "got {first:?}");
        // The second caller also waits behind the first caller's reservation
        assert!(approx_secs(second, 2.0), "got {second:?}");
    }

    #[test]
    fn test_five_mib_at_one_mib_per_sec_takes_five_seconds() {
        let limiter = RateLimiter::from_mb_per_sec(Some(1.0));
        let start = limiter.bucket.lock().unwrap().last_refill;

        // Simulate a single worker that sleeps exactly what it is told.
        let mut clock = start;
        for _ in 0..(5 * MIB / 8192) {
            clock += limiter.acquire_at(8192, clock);
        }

        let total = clock.duration_since(start);
        assert!(total >= Duration::from_millis(4999), "took {total:?}");
        assert!(total <= Duration::from_millis(5001), "took {total:?}");
    }

    #[test]
    fn test_concurrent_callers_share_budget() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(RateLimiter::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.acquire(1000))
            })
            .collect();

        let mut waits: Vec<Duration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        waits.sort();
        // Four seconds of budget were reserved in total, one per caller
        assert!(waits[3] >= Duration::from_millis(3900), "got {waits:?}");
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_negative_ignored() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
