//! Thinkific Downloader Core Library
//!
//! This library provides the download engine behind the Thinkific course
//! downloader: it takes `(url, destination, content type)` work items produced
//! by the course scraper and turns them into complete, validated files on disk.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Session credentials and download settings
//! - [`download`] - Parallel, resumable, rate-limited download engine
//!
//! Scraping course pages and rendering the offline viewer live outside this
//! crate and only talk to it through [`DownloadTask`] and [`DownloadManager`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, Settings};
pub use download::{
    ChecksumAlgorithm, ContentKind, DEFAULT_CONCURRENCY, DEFAULT_RETRY_ATTEMPTS, DownloadError,
    DownloadManager, DownloadTask, ErrorCategory, FailureType, FileValidator, FinalizeOutcome,
    ManagerError, RateLimiter, RetryDecision, RetryPolicy, TaskStatus, TransferSession,
    ValidationIssue, ValidationRequest, classify_error,
};
