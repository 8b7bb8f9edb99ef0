//! Fetching ad tags and firing tracking pixels.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{Result, VastError};

/// Retrieves ad tag documents. Implemented over HTTP by [`HttpFetcher`];
/// tests and offline hosts provide their own.
#[async_trait]
pub trait AdTagFetcher: Send + Sync {
    /// Fetch `url` and return the response body
    async fn fetch(&self, url: &str) -> Result<String>;

    /// Fire-and-forget request, used for tracking pixels
    async fn ping(&self, url: &str) -> Result<()> {
        self.fetch(url).await.map(|_| ())
    }
}

/// Fetches from `http(s)://` URLs, `file://` URLs and local paths
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_url(&self, url: &str) -> Result<String> {
        // Generate a random request ID for tracking in logs
        let req_id: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let url = url::Url::parse(url)?;
        log::debug!("[{}] Fetching ad tag: {}", req_id, url);
        let start_time = Instant::now();

        let response = self.client.get(url).send().await.map_err(|e| {
            log::warn!("[{}] Request failed after {:?}: {}", req_id, start_time.elapsed(), e);
            VastError::NetworkError(e)
        })?;

        let status = response.status();
        log::debug!("[{}] Received {} in {:?}", req_id, status, start_time.elapsed());
        if !status.is_success() {
            return Err(VastError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await?;
        log::debug!("[{}] Completed in {:?} ({} bytes)", req_id, start_time.elapsed(), body.len());
        Ok(body)
    }
}

#[async_trait]
impl AdTagFetcher for HttpFetcher {
    async fn fetch(&self, url_or_path: &str) -> Result<String> {
        if let Some(path) = local_path(url_or_path) {
            log::debug!("Reading ad tag from file: {}", path.display());
            return Ok(tokio::fs::read_to_string(path).await?);
        }
        self.fetch_url(url_or_path).await
    }
}

/// Whether `value` can name a resource: an absolute URL, or a plain path
/// left to whoever opens it. Never touches the filesystem.
pub fn is_locator(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    url::Url::parse(value).is_ok() || (!value.contains("://") && !value.chars().any(char::is_whitespace))
}

/// Local file behind a `file://` URL or a plain path that exists
fn local_path(url_or_path: &str) -> Option<PathBuf> {
    if let Some(path) = url_or_path.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    let path = Path::new(url_or_path);
    path.exists().then(|| path.to_path_buf())
}
