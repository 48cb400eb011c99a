//! Configuration for the skrapp worker

mod crawler;
mod js_domains;
mod logging;
mod worker;

pub use crawler::{CrawlerConfig, QualityConfig, DEFAULT_USER_AGENT};
pub use js_domains::{detected_reason, is_js_heavy_host};
pub use logging::{init_tracing, LogFormat, LogLevel, LoggingConfig};
pub use worker::WorkerConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the crawler worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the state database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory job outputs are written under (one subdirectory per job)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Crawl engine configuration
    #[serde(default)]
    pub crawler: CrawlerConfig,
    /// Quality gate configuration
    #[serde(default)]
    pub quality: QualityConfig,
    /// Supervisor configuration
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("out/jobs")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            crawler: CrawlerConfig::default(),
            quality: QualityConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides
    /// and validate. Callers get a ready-to-use config or a combined error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build a config from defaults plus environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        read_env("MAX_PAGES_LIMIT", &mut self.crawler.max_pages_limit);
        read_env("DEFAULT_MAX_PAGES", &mut self.crawler.default_max_pages);
        read_env(
            "CRAWLER_CONCURRENT_REQUESTS",
            &mut self.crawler.concurrent_requests,
        );
        if let Some(delay_secs) = env_parse::<f64>("CRAWLER_DOWNLOAD_DELAY") {
            self.crawler.download_delay_ms = (delay_secs * 1000.0) as u64;
        }
        read_env("CRAWLER_DEPTH_LIMIT", &mut self.crawler.depth_limit);
        if let Ok(agent) = std::env::var("CRAWLER_USER_AGENT") {
            if !agent.is_empty() {
                self.crawler.user_agent = agent;
            }
        }
        read_env(
            "WORKER_POLL_INTERVAL_SECONDS",
            &mut self.worker.poll_interval_secs,
        );
        read_env(
            "HEARTBEAT_INTERVAL_SECONDS",
            &mut self.worker.heartbeat_interval_secs,
        );
        read_env(
            "ORPHANED_THRESHOLD_SECONDS",
            &mut self.worker.orphaned_threshold_secs,
        );
        read_env(
            "STALLED_THRESHOLD_SECONDS",
            &mut self.worker.stalled_threshold_secs,
        );
        read_env(
            "HARD_STALLED_THRESHOLD_SECONDS",
            &mut self.worker.hard_stalled_threshold_secs,
        );
        read_env(
            "MIN_TEXT_LENGTH_SUCCESS",
            &mut self.quality.min_text_length_success,
        );
        read_env(
            "MIN_TEXT_LENGTH_MARGINAL",
            &mut self.quality.min_text_length_marginal,
        );
        read_env("JOB_EXPIRY_HOURS", &mut self.worker.job_expiry_hours);
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.crawler.max_pages_limit == 0 {
            errors.push("max_pages_limit must be positive".to_string());
        }
        if self.crawler.default_max_pages == 0 {
            errors.push("default_max_pages must be positive".to_string());
        }
        if self.crawler.default_max_pages > self.crawler.max_pages_limit {
            errors.push(format!(
                "default_max_pages ({}) must not exceed max_pages_limit ({})",
                self.crawler.default_max_pages, self.crawler.max_pages_limit
            ));
        }
        if self.crawler.concurrent_requests == 0 {
            errors.push("concurrent_requests must be positive".to_string());
        }
        if self.crawler.render_concurrency == 0 || self.crawler.render_concurrency > 4 {
            errors.push("render_concurrency must be between 1 and 4".to_string());
        }
        if self.crawler.user_agent.is_empty() {
            errors.push("user_agent must not be empty".to_string());
        }
        if self.crawler.max_redirects == 0 {
            errors.push("max_redirects must be positive".to_string());
        }

        if self.quality.min_text_length_marginal >= self.quality.min_text_length_success {
            errors.push(format!(
                "min_text_length_marginal ({}) must be below min_text_length_success ({})",
                self.quality.min_text_length_marginal, self.quality.min_text_length_success
            ));
        }
        if self.quality.pass_threshold <= self.quality.marginal_threshold {
            errors.push("pass_threshold must be above marginal_threshold".to_string());
        }
        if self.quality.pass_threshold > 1.0 || self.quality.marginal_threshold < 0.0 {
            errors.push("quality thresholds must lie in [0, 1]".to_string());
        }

        if self.worker.poll_interval_secs == 0 {
            errors.push("poll_interval_secs must be positive".to_string());
        }
        if self.worker.heartbeat_interval_secs == 0 {
            errors.push("heartbeat_interval_secs must be positive".to_string());
        }
        if self.worker.lease_ttl_secs == 0 {
            errors.push("lease_ttl_secs must be positive".to_string());
        }
        if self.worker.job_expiry_hours <= 0 {
            errors.push("job_expiry_hours must be positive".to_string());
        }

        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            errors.push("output_dir must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn read_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Some(value) = env_parse(key) {
        *target = value;
    }
}
