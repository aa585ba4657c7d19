//! Polite, retrying page fetcher.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// 5xx, 408 and 429 responses are worth another attempt; other statuses
/// will not change on retry.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Retry schedule for one page: `retries` extra attempts, the n-th waiting
/// `initial_delay * 2^n` up to `delay_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt numbered `failed` (zero based).
    pub fn pause_after(&self, failed: u32) -> Duration {
        2u32.checked_pow(failed)
            .map(|factor| self.initial_delay.saturating_mul(factor))
            .unwrap_or(self.delay_cap)
            .min(self.delay_cap)
    }
}

/// Randomized pause inserted between consecutive page requests.
#[derive(Debug, Clone, Copy)]
pub struct PolitenessDelay {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PolitenessDelay {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(2000),
        }
    }
}

impl PolitenessDelay {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Uniform pick in `[min, max]`; an inverted window collapses to `min`.
    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub politeness: PolitenessDelay,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
            politeness: PolitenessDelay::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: u32,
    },
    #[error("{0}")]
    Other(String),
}

/// Where listing pages come from. The HTTP implementation is used in
/// production; tests substitute canned pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;

    /// Pause between two consecutive requests of the same run.
    async fn wait_between_requests(&self);
}

/// A failed attempt and whether repeating it could help.
struct AttemptFailure {
    error: FetchError,
    transient: bool,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    politeness: PolitenessDelay,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building page fetch client")?,
            retry: config.retry,
            politeness: config.politeness,
        })
    }

    async fn attempt(&self, url: &str, attempts: u32) -> Result<String, AttemptFailure> {
        let request_failed = |source: reqwest::Error| AttemptFailure {
            transient: is_transient_error(&source),
            error: FetchError::Request {
                url: url.to_string(),
                attempts,
                source,
            },
        };

        let resp = self.client.get(url).send().await.map_err(request_failed)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AttemptFailure {
                transient: is_transient_status(status),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    attempts,
                },
            });
        }
        resp.text().await.map_err(request_failed)
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<String, FetchError> {
        let mut failed = 0u32;
        loop {
            match self.attempt(url, failed + 1).await {
                Ok(body) => return Ok(body),
                Err(failure) if failure.transient && failed < self.retry.retries => {
                    let pause = self.retry.pause_after(failed);
                    warn!(
                        attempt = failed + 1,
                        pause_ms = pause.as_millis() as u64,
                        error = %failure.error,
                        "page fetch failed; retrying"
                    );
                    tokio::time::sleep(pause).await;
                    failed += 1;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn wait_between_requests(&self) {
        tokio::time::sleep(self.politeness.sample()).await;
    }
}
