//! Reference image download with retry on transient failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PrecomputeError, Result};

/// HTTP statuses worth retrying.
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Returns `true` for statuses in [`RETRY_STATUSES`].
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRY_STATUSES.contains(&status)
}

/// Retry and timeout policy of the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every later one.
    pub backoff_ms: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 100,
            timeout_secs: 10,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.min(10);
        self
    }

    #[must_use]
    pub fn with_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs.max(1);
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

/// Source of reference image bytes.
pub trait ImageFetcher: Send + Sync + 'static {
    /// Fetches the bytes behind `url`.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<F: ImageFetcher> ImageFetcher for Arc<F> {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (**self).fetch(url)
    }
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    retry: RetryConfig,
}

/// What to do after one attempt failed.
enum Attempt {
    Retry(String),
    Fail(String),
}

impl Downloader {
    /// # Errors
    ///
    /// Returns `Http` if the client cannot be built.
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(retry.timeout_secs))
            .user_agent(concat!("cardsight/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, retry })
    }

    async fn attempt(&self, url: &str) -> std::result::Result<Vec<u8>, Attempt> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Err(Attempt::Fail(e.to_string())),
            Err(e) => return Err(Attempt::Retry(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {status}");
            return Err(if is_retryable_status(status.as_u16()) {
                Attempt::Retry(reason)
            } else {
                Attempt::Fail(reason)
            });
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Attempt::Retry(e.to_string()))
    }
}

impl ImageFetcher for Downloader {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.attempt(url).await {
                Ok(bytes) => {
                    debug!(url, bytes = bytes.len(), "downloaded image");
                    return Ok(bytes);
                }
                Err(Attempt::Retry(reason)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(url, attempt = attempt + 1, ?delay, %reason, "retrying download");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Attempt::Retry(reason) | Attempt::Fail(reason)) => {
                    return Err(PrecomputeError::Download {
                        url: url.to_string(),
                        reason,
                    });
                }
            }
        }
    }
}
