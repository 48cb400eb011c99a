//! Crawler and quality-gate configuration

use serde::{Deserialize, Serialize};

/// Default user agent sent on every fetch
pub const DEFAULT_USER_AGENT: &str = "SkrappBot/1.0";

/// Crawl engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Hard cap on per-job max_pages
    pub max_pages_limit: u64,
    /// Page budget used when a job does not specify one
    pub default_max_pages: u64,
    /// HTTP fetcher parallelism
    pub concurrent_requests: usize,
    /// Browser-render fetcher parallelism
    pub render_concurrency: usize,
    /// Minimum delay between requests per worker (milliseconds)
    pub download_delay_ms: u64,
    /// Maximum crawl depth from the seed URL
    pub depth_limit: u32,
    /// User agent string
    pub user_agent: String,
    /// Per-fetch timeout for the HTTP backend (seconds)
    pub request_timeout_secs: u64,
    /// Per-fetch timeout for the render backend (seconds)
    pub render_timeout_secs: u64,
    /// Post-load wait applied by the render backend (milliseconds)
    pub render_post_load_wait_ms: u64,
    /// Render service endpoint; the browser itself is an external collaborator
    pub render_endpoint: Option<String>,
    /// Maximum redirects to follow
    pub max_redirects: usize,
    /// Maximum response body size (bytes)
    pub max_content_size: usize,
    /// File extensions that are never crawled
    pub excluded_extensions: Vec<String>,
    /// Completed fetches required before the fallback rule is evaluated
    pub fallback_min_fetches: u64,
    /// Elapsed time after which the fallback rule is evaluated regardless (seconds)
    pub fallback_window_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pages_limit: 1000,
            default_max_pages: 100,
            concurrent_requests: 128,
            render_concurrency: 2,
            download_delay_ms: 20,
            depth_limit: 20,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 30,
            render_timeout_secs: 60,
            render_post_load_wait_ms: 2000,
            render_endpoint: None,
            max_redirects: 10,
            max_content_size: 10 * 1024 * 1024,
            excluded_extensions: default_excluded_extensions(),
            fallback_min_fetches: 10,
            fallback_window_secs: 30,
        }
    }
}

fn default_excluded_extensions() -> Vec<String> {
    [
        ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".bmp",
        ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx",
        ".zip", ".tar", ".gz", ".rar", ".7z",
        ".css", ".js", ".json", ".xml",
        ".woff", ".woff2", ".ttf", ".eot", ".otf",
        ".mp3", ".mp4", ".avi", ".mov", ".webm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Quality gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Text length at which the length feature saturates
    pub min_text_length_success: usize,
    /// Text length below which the length feature is zero
    pub min_text_length_marginal: usize,
    /// Score at or above which a page is exported
    pub pass_threshold: f64,
    /// Score at or above which a page earns a re-extraction attempt
    pub marginal_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_text_length_success: 200,
            min_text_length_marginal: 50,
            pass_threshold: 0.6,
            marginal_threshold: 0.3,
        }
    }
}
