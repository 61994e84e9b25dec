use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Method, StatusCode};
use thiserror::Error;

use crate::clock::{Sleeper, TokioSleeper};

/// Timeout for scraping third-party landing pages.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for JSON API calls (search, generation jobs, asset downloads).
pub const API_TIMEOUT: Duration = Duration::from_secs(30);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { status: StatusCode, url: String },
}

impl FetchError {
    /// Connection failures, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(is_transient_status).unwrap_or(false)
            }
            FetchError::Status { status, .. } => is_transient_status(*status),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (1-based): base, 2×base, 4×base, … capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "{} failed: {}; retrying ({}/{}) in {:?}",
                    what, e, attempt, policy.max_attempts, delay
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Source of raw page markup. The scraper only needs this much of HTTP.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

/// reqwest-backed fetcher with a fixed header set, per-call timeout and retry.
pub struct HttpFetcher {
    client: reqwest::Client,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
    timeout: Duration,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(headers: HeaderMap, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent("paper-visualizer/0.1")
                .build()?,
            headers,
            basic_auth: None,
            timeout,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Fetcher that presents itself as a desktop browser, for publisher pages.
    pub fn browser(timeout: Duration) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        Self::new(headers, timeout)
    }

    pub fn with_basic_auth(mut self, user: String, password: String) -> Self {
        self.basic_auth = Some((user, password));
        self
    }

    /// GET `url` and return the body.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.send(Method::GET, url, None).await
    }

    /// Send a request with an optional JSON body and return the response body.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, FetchError> {
        let what = format!("{} {}", method, url);
        with_retry(&self.retry, self.sleeper.as_ref(), &what, || {
            self.send_once(method.clone(), url, body)
        })
        .await
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, FetchError> {
        tracing::debug!("{} {}", method, url);
        let mut req = self
            .client
            .request(method, url)
            .headers(self.headers.clone())
            .timeout(self.timeout);
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status { status, url: url.to_string() });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let body = self.fetch(url).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
