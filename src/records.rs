//! Output record types and the JSONL codec.
//!
//! Every file the crawler emits (`pages.raw.jsonl`, `pages.jsonl`,
//! `summary.json`) and the job status shape consumed by the UI are declared
//! here and serialized through serde. No other module builds ad-hoc JSON for
//! the corpus files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::types::{Job, SiteStatus};

/// One line of `pages.raw.jsonl`: a single stored frontier entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPageRecord {
    pub url: String,
    pub canonical_url: String,
    pub status_code: u16,
    pub depth: u32,
    pub title: String,
    pub text: String,
    pub outlinks: Vec<String>,
    pub extracted_at: DateTime<Utc>,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub content_hash: String,
}

/// One line of the deduplicated `pages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub canonical_url: String,
    pub status_code: u16,
    pub depth: u32,
    pub title: String,
    pub text: String,
    pub outlinks: Vec<String>,
    pub extracted_at: DateTime<Utc>,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub content_hash: String,
    pub url_aliases: Vec<String>,
}

impl PageRecord {
    pub fn from_raw(raw: RawPageRecord, url_aliases: Vec<String>) -> Self {
        Self {
            url: raw.url,
            canonical_url: raw.canonical_url,
            status_code: raw.status_code,
            depth: raw.depth,
            title: raw.title,
            text: raw.text,
            outlinks: raw.outlinks,
            extracted_at: raw.extracted_at,
            quality_score: raw.quality_score,
            quality_passed: raw.quality_passed,
            content_hash: raw.content_hash,
            url_aliases,
        }
    }
}

/// Count of a single error type, for the summary's top-error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorTypeCount {
    pub error: String,
    pub count: u64,
}

/// `summary.json` for a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub job_id: String,
    pub start_url: String,
    pub allowed_host: String,
    pub total_fetched: u64,
    pub total_exported: u64,
    pub total_errors: u64,
    pub site_status: SiteStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: i64,
    pub status_code_histogram: BTreeMap<u16, u64>,
    pub top_error_types: Vec<ErrorTypeCount>,
    pub crawler_strategy: Option<String>,
    pub fallback_occurred: bool,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_evidence: Option<serde_json::Value>,
}

/// Job record wire shape, as consumed by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: String,
    pub start_url: String,
    pub allowed_host: String,
    pub max_pages: u64,
    pub pages_fetched: u64,
    pub pages_exported: u64,
    pub errors_count: u64,
    pub elapsed_seconds: i64,
    pub site_status: SiteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl JobStatus {
    pub fn from_job(job: &Job, now: DateTime<Utc>, download_url: Option<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state.as_str().to_string(),
            start_url: job.spec.start_url.clone(),
            allowed_host: job.spec.allowed_host.clone(),
            max_pages: job.spec.max_pages,
            pages_fetched: job.pages_fetched,
            pages_exported: job.pages_exported,
            errors_count: job.errors_count,
            elapsed_seconds: job.elapsed_seconds(now),
            site_status: job.site_status,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            expires_at: job.expires_at,
            download_url,
        }
    }
}

/// Entry in `kb/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbManifestEntry {
    pub id: String,
    pub filename: String,
    pub source_url: String,
    pub title: String,
    pub text_length: usize,
    pub content_hash: String,
}

/// `kb/manifest.json`: index of all exported knowledge-base pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbManifest {
    pub job_id: String,
    pub generated_at: DateTime<Utc>,
    pub format_version: String,
    pub total_pages: usize,
    pub pages: Vec<KbManifestEntry>,
}

/// Serialize a record as one JSONL line (no trailing newline).
pub fn to_jsonl_line<T: Serialize>(record: &T) -> serde_json::Result<String> {
    serde_json::to_string(record)
}

/// Append a record to a JSONL writer, flushing so partial crawls survive
/// a crash with whole lines only.
pub fn append_jsonl<T: Serialize, W: Write>(writer: &mut W, record: &T) -> anyhow::Result<()> {
    let line = serde_json::to_string(record)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Read all raw page records from a JSONL file, skipping malformed lines.
pub fn read_raw_records(path: &Path) -> anyhow::Result<Vec<RawPageRecord>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawPageRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping malformed raw record: {}", e),
        }
    }
    Ok(records)
}
