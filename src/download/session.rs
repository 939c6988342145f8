//! Authenticated HTTP session shared by every transfer worker.
//!
//! A [`TransferSession`] wraps one pooled `reqwest::Client` carrying the
//! browser session headers, and adds bounded retries with backoff on top of
//! single requests. It never touches the file system.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONTENT_LENGTH, COOKIE, HeaderMap, HeaderName, HeaderValue,
    InvalidHeaderValue, RANGE, RETRY_AFTER, USER_AGENT,
};
use reqwest::{Client, Method, Response};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, GET_TIMEOUT_SECS, HEAD_TIMEOUT_SECS, POOL_MAX_IDLE_PER_HOST,
};
use super::error::DownloadError;
use super::rate_limiter::parse_retry_after;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use crate::config::Settings;

/// Browser User-Agent sent with every request.
///
/// The platform serves lesson assets to browser sessions only, so the
/// session impersonates the browser the cookie was copied from.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const CLIENT_DATE_HEADER: HeaderName = HeaderName::from_static("x-thinkific-client-date");
const SEC_FETCH_MODE: HeaderName = HeaderName::from_static("sec-fetch-mode");
const SEC_FETCH_SITE: HeaderName = HeaderName::from_static("sec-fetch-site");
const X_REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");

/// Errors raised while building a [`TransferSession`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// A credential contains characters that are not valid in an HTTP header.
    #[error("{name} is not a valid header value: {source}")]
    InvalidHeader {
        /// Header that could not be built.
        name: &'static str,
        /// The underlying header error.
        #[source]
        source: InvalidHeaderValue,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Pooled, authenticated HTTP client with retry support.
///
/// Cloning is cheap and clones share the connection pool and the closed flag.
#[derive(Debug, Clone)]
pub struct TransferSession {
    client: Client,
    headers: HeaderMap,
    retry_policy: RetryPolicy,
    closed: Arc<AtomicBool>,
    trace_headers: bool,
}

impl TransferSession {
    /// Builds a session from the credentials and retry budget in `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if a credential is not a valid header value
    /// or the client cannot be built.
    pub fn new(settings: &Settings) -> Result<Self, SessionError> {
        let headers = session_headers(settings)?;
        let client = Client::builder()
            .default_headers(headers.clone())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(GET_TIMEOUT_SECS))
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;

        Ok(Self {
            client,
            headers,
            retry_policy: RetryPolicy::from_retry_attempts(settings.retry_attempts),
            closed: Arc::new(AtomicBool::new(false)),
            trace_headers: settings.debug,
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Returns the retry policy in use.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Issues a GET, optionally resuming at `range_offset`.
    ///
    /// A range request asks for `Accept-Encoding: identity` so byte offsets
    /// refer to the stored file. Both 200 and 206 count as success; the
    /// caller decides whether to append or restart.
    ///
    /// # Errors
    ///
    /// Returns the last [`DownloadError`] once retries are exhausted, or
    /// immediately for failures that are not worth retrying.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get(
        &self,
        url: &str,
        range_offset: Option<u64>,
    ) -> Result<Response, DownloadError> {
        self.send_with_retry(Method::GET, url, range_offset.filter(|&offset| offset > 0))
            .await
    }

    /// Issues a HEAD request.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    #[instrument(skip(self), fields(url = %url))]
    pub async fn head(&self, url: &str) -> Result<Response, DownloadError> {
        self.send_with_retry(Method::HEAD, url, None).await
    }

    /// Best-effort size lookup through HEAD. Any failure yields `None`.
    pub async fn content_length(&self, url: &str) -> Option<u64> {
        match self.head(url).await {
            Ok(response) => header_content_length(&response),
            Err(error) => {
                debug!(url, %error, "size lookup failed");
                None
            }
        }
    }

    /// Marks the session closed. Requests issued afterwards fail with
    /// [`DownloadError::SessionClosed`]; requests already in flight finish.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("transfer session closed");
        }
    }

    /// Whether [`close`](Self::close) was called on this session or a clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        range_offset: Option<u64>,
    ) -> Result<Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut attempt: u32 = 1;
        loop {
            if self.is_closed() {
                return Err(DownloadError::session_closed(url));
            }

            let error = match self.send_once(method.clone(), url, range_offset).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let failure = classify_error(&error);
            match self.retry_policy.should_retry(failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = match (&error, failure) {
                        (
                            DownloadError::HttpStatus {
                                retry_after: Some(value),
                                ..
                            },
                            FailureType::RateLimited,
                        ) => parse_retry_after(value).unwrap_or(delay),
                        _ => delay,
                    };
                    warn!(
                        url,
                        attempt,
                        next_attempt = next,
                        delay_ms = delay.as_millis(),
                        %error,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, attempt, %reason, "giving up on request");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        range_offset: Option<u64>,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.request(method.clone(), url);
        if method == Method::HEAD {
            request = request.timeout(Duration::from_secs(HEAD_TIMEOUT_SECS));
        }
        if let Some(offset) = range_offset {
            request = request
                .header(RANGE, format!("bytes={offset}-"))
                .header(ACCEPT_ENCODING, "identity");
        }

        if self.trace_headers {
            // Sensitive header values render as `Sensitive` in Debug output.
            debug!(%method, url, range_offset, headers = ?self.headers, "sending request");
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if self.trace_headers {
            debug!(%method, url, status = status.as_u16(), "received response");
        }
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);
        Err(DownloadError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ))
    }
}

/// Reads the `Content-Length` header of a response.
pub(crate) fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn session_headers(settings: &Settings) -> Result<HeaderMap, SessionError> {
    let header = |name: &'static str, value: &str| {
        HeaderValue::from_str(value).map_err(|source| SessionError::InvalidHeader { name, source })
    };

    let mut cookie = header("COOKIE_DATA", &settings.cookie_data)?;
    cookie.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, cookie);
    headers.insert(CLIENT_DATE_HEADER, header("CLIENT_DATE", &settings.client_date)?);
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(SEC_FETCH_MODE, HeaderValue::from_static("cors"));
    headers.insert(SEC_FETCH_SITE, HeaderValue::from_static("same-origin"));
    headers.insert(X_REQUESTED_WITH, HeaderValue::from_static("XMLHttpRequest"));
    Ok(headers)
}
