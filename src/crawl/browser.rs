//! Browser-render fetch backend
//!
//! JS-heavy sites go through an external render service that drives the
//! actual browser; this module only speaks its HTTP API. The service takes
//! a URL plus a post-load wait and returns the rendered DOM, so the engine
//! sees the same `FetchOutcome` shape as the fast HTTP path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use url::Url;

use super::fetcher::{FetchError, FetchOutcome, PageFetcher};

/// Request body sent to the render service
#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    /// Extra wait after load, for late-hydrating SPAs (milliseconds)
    wait_ms: u64,
}

/// Response body from the render service
#[derive(Debug, Deserialize)]
struct RenderResponse {
    status_code: u16,
    final_url: String,
    #[serde(default)]
    content_type: Option<String>,
    body: String,
}

/// Configuration for the render backend
#[derive(Debug, Clone)]
pub struct RenderFetcherConfig {
    pub endpoint: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub post_load_wait: Duration,
    pub concurrency: usize,
}

/// Browser-render backend behind the shared fetcher contract
pub struct RenderFetcher {
    client: reqwest::Client,
    config: RenderFetcherConfig,
}

impl RenderFetcher {
    pub fn new(config: RenderFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("{} (JS-enabled)", config.user_agent))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PageFetcher for RenderFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let start = Instant::now();
        let request = RenderRequest {
            url: url.as_str(),
            wait_ms: self.config.post_load_wait.as_millis() as u64,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.config.timeout)
                } else {
                    FetchError::Render(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Render(format!(
                "render service returned {}",
                response.status()
            )));
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Render(format!("bad render response: {}", e)))?;

        let final_url = Url::parse(&rendered.final_url)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        Ok(FetchOutcome {
            final_url,
            status_code: rendered.status_code,
            headers: Vec::new(),
            content_type: rendered
                .content_type
                .unwrap_or_else(|| "text/html".to_string()),
            body: rendered.body,
            elapsed: start.elapsed(),
            js_rendered: true,
        })
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    fn label(&self) -> &'static str {
        "render"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fetcher_builds() {
        let fetcher = RenderFetcher::new(RenderFetcherConfig {
            endpoint: "http://localhost:9222/render".to_string(),
            user_agent: "SkrappBot/1.0".to_string(),
            timeout: Duration::from_secs(60),
            post_load_wait: Duration::from_secs(2),
            concurrency: 2,
        })
        .unwrap();
        assert_eq!(fetcher.concurrency(), 2);
        assert_eq!(fetcher.label(), "render");
    }

    #[test]
    fn render_response_deserializes_without_content_type() {
        let json = r#"{"status_code":200,"final_url":"https://example.test/","body":"<html></html>"}"#;
        let resp: RenderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status_code, 200);
        assert!(resp.content_type.is_none());
    }
}
