//! Core domain types: jobs, frontier entries, documents, and events.
//!
//! Every mutable piece of crawl state is persisted through the store, so the
//! types here are plain data carriers with serde derives. The one piece of
//! behavior that lives here is the job state machine: `JobState::can_transition`
//! is the single authority on which lifecycle transitions are legal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Finalizing,
    Done,
    Failed,
    Cancelled,
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "finalizing" => Some(Self::Finalizing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal states freeze the job: no further transitions or counter
    /// updates are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// `Running -> Queued` is the supervisor restart path; `* -> Expired`
    /// covers TTL expiry of any non-terminal state.
    pub fn can_transition(&self, to: JobState) -> bool {
        use JobState::*;
        if *self == to {
            return false;
        }
        match (*self, to) {
            (_, Expired) => !self.is_terminal(),
            (Queued, Running) => true,
            (Running, Finalizing) | (Running, Failed) | (Running, Cancelled) => true,
            (Running, Queued) => true,
            (Finalizing, Done) | (Finalizing, Failed) | (Finalizing, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable crawl configuration, fixed at job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Seed URL the crawl starts from
    pub start_url: String,
    /// Exact host every admitted URL must match
    pub allowed_host: String,
    /// Page budget for the job
    pub max_pages: u64,
    /// Wall-clock budget for the crawl phase
    pub timeout_seconds: u64,
    /// Path prefixes that are never crawled
    pub ignore_path_prefixes: Vec<String>,
    /// Force the browser-render backend from the start
    pub use_js: bool,
}

/// One crawl job, as stored.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub token_hash: String,
    pub spec: JobSpec,
    pub state: JobState,
    pub cancel_requested: bool,
    pub pages_fetched: u64,
    pub pages_exported: u64,
    pub errors_count: u64,
    pub restart_count: u32,
    pub site_status: SiteStatus,
    pub block_evidence: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub crawler_strategy: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            (Some(start), None) => (now - start).num_seconds(),
            _ => 0,
        }
    }
}

/// Processing state of a single frontier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlState {
    Queued,
    Fetching,
    Fetched,
    Parsed,
    Stored,
    Failed,
    Skipped,
}

impl UrlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Fetched => "fetched",
            Self::Parsed => "parsed",
            Self::Stored => "stored",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "fetching" => Some(Self::Fetching),
            "fetched" => Some(Self::Fetched),
            "parsed" => Some(Self::Parsed),
            "stored" => Some(Self::Stored),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stored | Self::Failed | Self::Skipped)
    }
}

/// One pending or completed URL for one job.
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub id: i64,
    pub job_id: String,
    pub url: String,
    pub canonical_url: String,
    pub state: UrlState,
    pub depth: u32,
    pub priority: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_status_code: Option<u16>,
    pub discovered_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub earliest_visible_at: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub parsed_at: Option<DateTime<Utc>>,
    pub stored_at: Option<DateTime<Utc>>,
}

/// A deduplicated piece of extracted content.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub job_id: String,
    pub content_hash: String,
    pub title_hash: Option<String>,
    pub primary_url: String,
    pub primary_canonical: String,
    pub title: String,
    pub language: Option<String>,
    pub doc_type: String,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub version: u32,
}

/// Why a URL maps to an existing document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasReason {
    Canonical,
    ContentHash,
    Redirect,
    LanguageVariant,
}

impl AliasReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canonical => "canonical",
            Self::ContentHash => "content_hash",
            Self::Redirect => "redirect",
            Self::LanguageVariant => "language_variant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "canonical" => Some(Self::Canonical),
            "content_hash" => Some(Self::ContentHash),
            "redirect" => Some(Self::Redirect),
            "language_variant" => Some(Self::LanguageVariant),
            _ => None,
        }
    }
}

/// url -> document mapping.
#[derive(Debug, Clone)]
pub struct DocumentUrl {
    pub document_id: String,
    pub job_id: String,
    pub url: String,
    pub canonical_url: String,
    pub match_reason: AliasReason,
    pub is_primary: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Derived label summarizing how the target site is responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Unknown,
    Normal,
    Throttled,
    Blocked,
    LoginRequired,
    SwitchedToJs,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Normal => "normal",
            Self::Throttled => "throttled",
            Self::Blocked => "blocked",
            Self::LoginRequired => "login_required",
            Self::SwitchedToJs => "switched_to_js",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "normal" => Some(Self::Normal),
            "throttled" => Some(Self::Throttled),
            "blocked" => Some(Self::Blocked),
            "login_required" => Some(Self::LoginRequired),
            "switched_to_js" => Some(Self::SwitchedToJs),
            _ => None,
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only job event log row.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub level: String,
    pub event: String,
    pub data: Option<serde_json::Value>,
}

/// Kind of downloadable output registered after finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    PagesRawJsonl,
    PagesJsonl,
    SummaryJson,
    KbManifest,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PagesRawJsonl => "pages_raw_jsonl",
            Self::PagesJsonl => "pages_jsonl",
            Self::SummaryJson => "summary_json",
            Self::KbManifest => "kb_manifest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pages_raw_jsonl" => Some(Self::PagesRawJsonl),
            "pages_jsonl" => Some(Self::PagesJsonl),
            "summary_json" => Some(Self::SummaryJson),
            "kb_manifest" => Some(Self::KbManifest),
            _ => None,
        }
    }
}

/// One registered output file.
#[derive(Debug, Clone)]
pub struct JobArtifact {
    pub id: i64,
    pub job_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub byte_size: u64,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use JobState::*;
        assert!(Queued.can_transition(Running));
        assert!(Running.can_transition(Finalizing));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));
        assert!(Running.can_transition(Queued));
        assert!(Finalizing.can_transition(Done));
        assert!(Finalizing.can_transition(Cancelled));
        assert!(Finalizing.can_transition(Failed));
    }

    #[test]
    fn expiry_reaches_every_nonterminal_state() {
        use JobState::*;
        for state in [Queued, Running, Finalizing] {
            assert!(state.can_transition(Expired), "{state} should expire");
        }
    }

    #[test]
    fn terminal_states_are_frozen() {
        use JobState::*;
        for from in [Done, Failed, Cancelled, Expired] {
            for to in [Queued, Running, Finalizing, Done, Failed, Cancelled, Expired] {
                assert!(!from.can_transition(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn illegal_transitions() {
        use JobState::*;
        assert!(!Queued.can_transition(Finalizing));
        assert!(!Queued.can_transition(Done));
        assert!(!Finalizing.can_transition(Running));
        assert!(!Running.can_transition(Done));
    }

    #[test]
    fn state_round_trips_through_strings() {
        use JobState::*;
        for state in [Queued, Running, Finalizing, Done, Failed, Cancelled, Expired] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn url_state_terminality() {
        assert!(UrlState::Stored.is_terminal());
        assert!(UrlState::Failed.is_terminal());
        assert!(UrlState::Skipped.is_terminal());
        assert!(!UrlState::Fetching.is_terminal());
        assert!(!UrlState::Fetched.is_terminal());
    }
}
