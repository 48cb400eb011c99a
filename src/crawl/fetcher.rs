//! Fetch backends for the crawl engine
//!
//! Two backends share one contract: the fast concurrent HTTP client defined
//! here, and the browser-render client in `browser.rs`. The engine only ever
//! talks to `dyn PageFetcher`, so the backend choice and the fallback switch
//! stay invisible to the rest of the pipeline.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

/// Errors from a fetch attempt
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("unsupported content type: {0}")]
    InvalidContentType(String),
    #[error("content too large: {0} bytes")]
    ContentTooLarge(usize),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("render backend error: {0}")]
    Render(String),
}

impl FetchError {
    /// Whether the error warrants a retry (network-level trouble) as opposed
    /// to a permanent condition like an unsupported content type.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Timeout(_) => true,
            Self::Render(_) => true,
            Self::TooManyRedirects
            | Self::InvalidContentType(_)
            | Self::ContentTooLarge(_)
            | Self::InvalidUrl(_) => false,
        }
    }
}

/// Result of a completed fetch
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status_code: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: String,
    /// Content type
    pub content_type: String,
    /// Time taken to fetch
    pub elapsed: Duration,
    /// Whether a browser rendered the page
    pub js_rendered: bool,
}

impl FetchOutcome {
    pub fn is_html(&self) -> bool {
        self.content_type.contains("text/html") || self.content_type.contains("application/xhtml")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

/// The contract both fetch backends implement.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch one URL, following redirects and reporting the final URL.
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError>;

    /// How many workers this backend supports.
    fn concurrency(&self) -> usize;

    /// Backend label used in logs and the job's crawler strategy.
    fn label(&self) -> &'static str;
}

/// Configuration for the HTTP fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub max_content_size: usize,
    pub concurrency: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            max_content_size: 10 * 1024 * 1024,
            concurrency: 128,
        }
    }
}

/// Fast concurrent HTTP backend over reqwest
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let start = Instant::now();

        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_redirect() {
                FetchError::TooManyRedirects
            } else if e.is_timeout() {
                FetchError::Timeout(self.config.timeout)
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();

        // Non-HTML payloads are not worth downloading; error statuses still
        // carry a useful body (blocking signatures live there).
        if status < 400
            && !content_type.contains("text/html")
            && !content_type.contains("application/xhtml")
            && !content_type.contains("text/plain")
        {
            return Err(FetchError::InvalidContentType(content_type));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.config.max_content_size {
                return Err(FetchError::ContentTooLarge(len as usize));
            }
        }

        let body = response.text().await?;
        if body.len() > self.config.max_content_size {
            return Err(FetchError::ContentTooLarge(body.len()));
        }

        Ok(FetchOutcome {
            final_url,
            status_code: status,
            headers,
            body,
            content_type,
            elapsed: start.elapsed(),
            js_rendered: false,
        })
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    fn label(&self) -> &'static str {
        "http"
    }
}
