//! HTTP fetcher with bounded retry
//!
//! One call to [`Downloader::fetch`] is one best-effort download of the
//! subscription into a caller-chosen file. Transport failures and statuses
//! above 404 are retried with exponential backoff; every wait observes the
//! cancellation token.

use crate::{Error, Result};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA,
};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whole-request timeout for a single attempt
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscription hosts commonly reject non-browser clients
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36 Edg/117.0.2045.31";

const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
     image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

const ACCEPT_LANGUAGE_VALUE: &str = "zh-CN,zh;q=0.9,en;q=0.8,en-GB;q=0.7,en-US;q=0.6";

/// Retry schedule: `max_attempts` tries, waiting `min(base * 2^attempt, cap)`
/// before every attempt after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Delay before the 0-indexed `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(15),
        }
    }
}

/// Subscription downloader
pub struct Downloader {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Self::with_policy(RetryPolicy::default(), ATTEMPT_TIMEOUT)
    }

    pub fn with_policy(policy: RetryPolicy, attempt_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        // Subscription endpoints are often self-signed. This client is only
        // ever used for the subscription download.
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(attempt_timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::internal(format!("failed to build http client: {}", e)))?;

        Ok(Downloader { client, policy })
    }

    /// Download `url` into `dest`, creating parent directories as needed
    pub async fn fetch(&self, url: &str, dest: &Path, token: &CancellationToken) -> Result<()> {
        info!("download: {}", url);

        let mut attempt = 0;
        let response = loop {
            if attempt > 0 {
                let delay = self.policy.delay(attempt);
                info!("sleep {:?} before attempt {}", delay, attempt + 1);
                tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                r = self.request(url) => r,
            };

            match result {
                Ok(response) => break response,
                Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    warn!("get error({}): {}", attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        save_body(response, dest).await
    }

    async fn request(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        debug!("response status {} from {}", status, url);
        if status != StatusCode::OK {
            return Err(Error::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }
}

async fn save_body(mut response: reqwest::Response, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::fs("mkdir", parent, e))?;
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| Error::fs("create", dest, e))?;

    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::fs("write", dest, e))?;
        written += chunk.len();
    }
    file.flush().await.map_err(|e| Error::fs("write", dest, e))?;

    debug!("saved {} bytes to {}", written, dest.display());
    Ok(())
}
