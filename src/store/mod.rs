//! Durable crawl state over SQLite
//!
//! The store is the single source of truth: every job transition, frontier
//! mutation, lease, document, event, and artifact goes through it so a
//! crashed or restarted worker can resume from disk. Each public method
//! takes the connection lock once, making the operation serializable at the
//! granularity of a single call.

mod schema;

pub use schema::initialize_schema;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    AliasReason, ArtifactKind, Document, DocumentUrl, EventLevel, FrontierEntry, Job, JobArtifact,
    JobEvent, JobSpec, JobState, SiteStatus, UrlState,
};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("illegal transition {from} -> {to} for job {job_id}")]
    IllegalTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Optional fields applied together with a state transition.
#[derive(Debug, Default)]
pub struct StateUpdate {
    pub last_error: Option<String>,
    pub pages_exported: Option<u64>,
    pub site_status: Option<SiteStatus>,
}

/// Terminal outcome for a frontier entry.
#[derive(Debug)]
pub enum UrlOutcome {
    Fetched {
        status_code: u16,
    },
    Parsed,
    Stored,
    Failed {
        status_code: Option<u16>,
        error: String,
    },
    Skipped {
        reason: String,
    },
    /// Restore the entry to queued with a visibility delay; flips to failed
    /// once the retry budget is exhausted.
    Retry {
        status_code: Option<u16>,
        error: String,
        backoff: Duration,
        max_retries: u32,
    },
}

/// Fields of a new document candidate; the store decides create-vs-attach.
#[derive(Debug)]
pub struct NewDocument<'a> {
    pub content_hash: &'a str,
    pub title_hash: Option<String>,
    pub url: &'a str,
    pub canonical_url: &'a str,
    pub title: &'a str,
    pub language: Option<&'a str>,
    pub doc_type: &'a str,
    pub quality_score: f64,
    pub quality_passed: bool,
}

/// SQLite-backed store
pub struct Store {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_ts_required(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ===== Jobs =====

    /// Create a new job in state `queued`.
    pub fn create_job(
        &self,
        spec: JobSpec,
        token_hash: &str,
        expiry_hours: i64,
    ) -> StoreResult<Job> {
        let conn = self.conn.lock();
        let job_id = format!("job_{}", &Uuid::new_v4().simple().to_string()[..16]);
        let now = Utc::now();
        let expires_at = now + Duration::hours(expiry_hours);
        conn.execute(
            "INSERT INTO jobs (
                id, token_hash, start_url, allowed_host, max_pages, timeout_seconds,
                ignore_path_prefixes, use_js, state, created_at, updated_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
            params![
                job_id,
                token_hash,
                spec.start_url,
                spec.allowed_host,
                spec.max_pages as i64,
                spec.timeout_seconds as i64,
                serde_json::to_string(&spec.ignore_path_prefixes)?,
                spec.use_js as i64,
                JobState::Queued.as_str(),
                ts(now),
                ts(expires_at),
            ],
        )?;
        Self::insert_event(
            &conn,
            &job_id,
            EventLevel::Info,
            "state_change",
            Some(serde_json::json!({ "from": null, "to": "queued" })),
        )?;
        Self::job_by_id(&conn, &job_id)?.ok_or_else(|| StoreError::JobNotFound(job_id))
    }

    pub fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let conn = self.conn.lock();
        Self::job_by_id(&conn, job_id)
    }

    /// Atomically claim the oldest queued job: state becomes `running` with
    /// fresh heartbeat and start timestamps.
    pub fn claim_next_queued_job(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let conn = self.conn.lock();
        let job_id: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = job_id else {
            return Ok(None);
        };
        let now = ts(Utc::now());
        conn.execute(
            "UPDATE jobs SET state = 'running', updated_at = ?1, heartbeat_at = ?1,
             started_at = COALESCE(started_at, ?1), last_progress_at = ?1
             WHERE id = ?2 AND state = 'queued'",
            params![now, job_id],
        )?;
        Self::insert_event(
            &conn,
            &job_id,
            EventLevel::Info,
            "state_change",
            Some(serde_json::json!({ "from": "queued", "to": "running", "worker": worker_id })),
        )?;
        Self::job_by_id(&conn, &job_id)
    }

    /// Update heartbeat and progress counters.
    ///
    /// Counters are monotonic; `last_progress_at` advances only when
    /// `pages_fetched` did. A terminal job is left untouched.
    pub fn heartbeat(&self, job_id: &str, pages_fetched: u64, errors_count: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        let Some(job) = Self::job_by_id(&conn, job_id)? else {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        };
        if job.state.is_terminal() {
            return Ok(());
        }
        let now = ts(Utc::now());
        let advanced = pages_fetched > job.pages_fetched;
        conn.execute(
            "UPDATE jobs SET heartbeat_at = ?1, updated_at = ?1,
             pages_fetched = MAX(pages_fetched, ?2),
             errors_count = MAX(errors_count, ?3),
             last_progress_at = CASE WHEN ?4 THEN ?1 ELSE last_progress_at END
             WHERE id = ?5",
            params![now, pages_fetched as i64, errors_count as i64, advanced, job_id],
        )?;
        Ok(())
    }

    /// Set the cooperative cancel flag; the engine observes it on its next
    /// heartbeat tick.
    pub fn request_cancel(&self, job_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), job_id],
        )?;
        Self::insert_event(&conn, job_id, EventLevel::Info, "cancel_requested", None)?;
        Ok(())
    }

    /// Validated state transition. Illegal transitions return an error and
    /// mutate nothing.
    pub fn set_state(
        &self,
        job_id: &str,
        new_state: JobState,
        update: StateUpdate,
    ) -> StoreResult<Job> {
        let conn = self.conn.lock();
        let Some(job) = Self::job_by_id(&conn, job_id)? else {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        };
        if !job.state.can_transition(new_state) {
            return Err(StoreError::IllegalTransition {
                job_id: job_id.to_string(),
                from: job.state,
                to: new_state,
            });
        }
        let now = ts(Utc::now());
        let set_started = new_state == JobState::Running && job.started_at.is_none();
        let set_finished = new_state.is_terminal() && job.finished_at.is_none();
        conn.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2,
             started_at = CASE WHEN ?3 THEN ?2 ELSE started_at END,
             finished_at = CASE WHEN ?4 THEN ?2 ELSE finished_at END,
             last_error = COALESCE(?5, last_error),
             pages_exported = COALESCE(?6, pages_exported),
             site_status = COALESCE(?7, site_status)
             WHERE id = ?8",
            params![
                new_state.as_str(),
                now,
                set_started,
                set_finished,
                update.last_error,
                update.pages_exported.map(|v| v as i64),
                update.site_status.map(|s| s.as_str()),
                job_id,
            ],
        )?;
        Self::insert_event(
            &conn,
            job_id,
            EventLevel::Info,
            "state_change",
            Some(serde_json::json!({ "from": job.state.as_str(), "to": new_state.as_str() })),
        )?;
        Self::job_by_id(&conn, job_id)?.ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    pub fn increment_restart_count(&self, job_id: &str) -> StoreResult<u32> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET restart_count = restart_count + 1, updated_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), job_id],
        )?;
        let count: u32 = conn.query_row(
            "SELECT restart_count FROM jobs WHERE id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_crawler_strategy(&self, job_id: &str, strategy: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET crawler_strategy = ?1, updated_at = ?2 WHERE id = ?3",
            params![strategy, ts(Utc::now()), job_id],
        )?;
        Ok(())
    }

    /// Record the blocking detector's verdict and evidence on the job row.
    pub fn update_site_status(
        &self,
        job_id: &str,
        status: SiteStatus,
        evidence: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET site_status = ?1, block_evidence = COALESCE(?2, block_evidence),
             updated_at = ?3 WHERE id = ?4 AND state NOT IN ('done','failed','cancelled','expired')",
            params![
                status.as_str(),
                evidence.map(|v| v.to_string()),
                ts(Utc::now()),
                job_id,
            ],
        )?;
        Ok(())
    }

    pub fn jobs_in_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE state = ?1 ORDER BY created_at ASC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([state.as_str()], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ===== Stall and expiry queries =====

    pub fn find_orphaned_jobs(&self, now: DateTime<Utc>, threshold_secs: i64) -> StoreResult<Vec<Job>> {
        let cutoff = ts(now - Duration::seconds(threshold_secs));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE state = 'running'
             AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([cutoff], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn find_stalled_jobs(&self, now: DateTime<Utc>, threshold_secs: i64) -> StoreResult<Vec<Job>> {
        let cutoff = ts(now - Duration::seconds(threshold_secs));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE state = 'running'
             AND last_progress_at IS NOT NULL AND last_progress_at < ?1
             AND pages_fetched > 0",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([cutoff], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn find_hard_stalled_jobs(
        &self,
        now: DateTime<Utc>,
        threshold_secs: i64,
    ) -> StoreResult<Vec<Job>> {
        let cutoff = ts(now - Duration::seconds(threshold_secs));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE state = 'running'
             AND started_at IS NOT NULL AND started_at < ?1
             AND pages_fetched = 0",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([cutoff], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn find_expired_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE state NOT IN ('done','failed','cancelled','expired') AND expires_at < ?1",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([ts(now)], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ===== Frontier =====

    /// Insert a URL if its canonical form is new for the job.
    /// Returns whether a row was inserted.
    pub fn enqueue_url(
        &self,
        job_id: &str,
        url: &str,
        canonical_url: &str,
        depth: u32,
        priority: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO url_queue (job_id, url, canonical_url, depth, priority, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![job_id, url, canonical_url, depth, priority, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Lease up to `batch` visible entries for a worker.
    ///
    /// Expired leases are released (and their retry budget charged) first,
    /// so an abandoned lease automatically becomes eligible again.
    pub fn lease_urls(
        &self,
        job_id: &str,
        worker_id: &str,
        batch: usize,
        lease_ttl: Duration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<FrontierEntry>> {
        let conn = self.conn.lock();
        Self::release_expired_leases(&conn, Some(job_id), max_retries, now)?;

        let mut stmt = conn.prepare(
            "SELECT id FROM url_queue
             WHERE job_id = ?1 AND state = 'queued'
               AND (earliest_visible_at IS NULL OR earliest_visible_at <= ?2)
             ORDER BY priority DESC, depth ASC, discovered_at ASC, id ASC
             LIMIT ?3",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![job_id, ts(now), batch as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let expires = ts(now + lease_ttl);
        let mut leased = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE url_queue SET state = 'fetching', leased_at = ?1, leased_by = ?2,
                 lease_expires_at = ?3 WHERE id = ?4",
                params![ts(now), worker_id, expires, id],
            )?;
            if let Some(entry) = Self::entry_by_id(&conn, id)? {
                leased.push(entry);
            }
        }
        Ok(leased)
    }

    /// Apply a completion outcome to a frontier entry.
    pub fn complete_url(&self, entry_id: i64, outcome: UrlOutcome) -> StoreResult<()> {
        let conn = self.conn.lock();
        let now = ts(Utc::now());
        match outcome {
            UrlOutcome::Fetched { status_code } => {
                conn.execute(
                    "UPDATE url_queue SET state = 'fetched', fetched_at = ?1,
                     last_status_code = ?2, leased_at = NULL, leased_by = NULL,
                     lease_expires_at = NULL WHERE id = ?3",
                    params![now, status_code, entry_id],
                )?;
            }
            UrlOutcome::Parsed => {
                conn.execute(
                    "UPDATE url_queue SET state = 'parsed', parsed_at = ?1 WHERE id = ?2",
                    params![now, entry_id],
                )?;
            }
            UrlOutcome::Stored => {
                conn.execute(
                    "UPDATE url_queue SET state = 'stored', stored_at = ?1 WHERE id = ?2",
                    params![now, entry_id],
                )?;
            }
            UrlOutcome::Failed { status_code, error } => {
                conn.execute(
                    "UPDATE url_queue SET state = 'failed', last_error = ?1,
                     last_status_code = COALESCE(?2, last_status_code),
                     leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                     WHERE id = ?3",
                    params![error, status_code, entry_id],
                )?;
            }
            UrlOutcome::Skipped { reason } => {
                conn.execute(
                    "UPDATE url_queue SET state = 'skipped', last_error = ?1,
                     leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                     WHERE id = ?2",
                    params![reason, entry_id],
                )?;
            }
            UrlOutcome::Retry {
                status_code,
                error,
                backoff,
                max_retries,
            } => {
                let retry_count: u32 = conn.query_row(
                    "SELECT retry_count FROM url_queue WHERE id = ?1",
                    [entry_id],
                    |row| row.get(0),
                )?;
                if retry_count >= max_retries {
                    conn.execute(
                        "UPDATE url_queue SET state = 'failed', last_error = ?1,
                         last_status_code = COALESCE(?2, last_status_code),
                         leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                         WHERE id = ?3",
                        params![error, status_code, entry_id],
                    )?;
                } else {
                    let visible_at = ts(Utc::now() + backoff);
                    conn.execute(
                        "UPDATE url_queue SET state = 'queued', retry_count = retry_count + 1,
                         last_error = ?1, last_status_code = COALESCE(?2, last_status_code),
                         earliest_visible_at = ?3,
                         leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                         WHERE id = ?4",
                        params![error, status_code, visible_at, entry_id],
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn frontier_entry(&self, entry_id: i64) -> StoreResult<Option<FrontierEntry>> {
        let conn = self.conn.lock();
        Self::entry_by_id(&conn, entry_id)
    }

    pub fn frontier_entry_by_canonical(
        &self,
        job_id: &str,
        canonical_url: &str,
    ) -> StoreResult<Option<FrontierEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM url_queue WHERE job_id = ?1 AND canonical_url = ?2",
                    ENTRY_COLUMNS
                ),
                params![job_id, canonical_url],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Entries that will or may still produce output: everything except
    /// failed and skipped. Used for the admission budget cap.
    pub fn active_entry_count(&self, job_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM url_queue WHERE job_id = ?1 AND state NOT IN ('failed','skipped')",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Entries still waiting for a worker (queued or leased out).
    pub fn pending_entry_count(&self, job_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM url_queue WHERE job_id = ?1 AND state IN ('queued','fetching')",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Reset non-terminal entries back to queued, used when the engine
    /// switches fetch backends. Retry counts are preserved.
    pub fn reset_nonterminal_entries(&self, job_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE url_queue SET state = 'queued', leased_at = NULL, leased_by = NULL,
             lease_expires_at = NULL
             WHERE job_id = ?1 AND state IN ('fetching','fetched','parsed')",
            [job_id],
        )?;
        Ok(changed as u64)
    }

    /// Release all expired leases (any job). Returns how many were released.
    pub fn expire_stale_leases(&self, now: DateTime<Utc>, max_retries: u32) -> StoreResult<u64> {
        let conn = self.conn.lock();
        Self::release_expired_leases(&conn, None, max_retries, now)
    }

    /// Frontier error counts, most frequent first.
    pub fn error_summary(&self, job_id: &str, limit: usize) -> StoreResult<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT last_error, COUNT(*) AS n FROM url_queue
             WHERE job_id = ?1 AND last_error IS NOT NULL AND state = 'failed'
             GROUP BY last_error ORDER BY n DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ===== Documents =====

    /// Deterministic upsert: the first URL producing a content hash creates
    /// the document and becomes its primary; later producers get the
    /// existing document back with `is_new = false`.
    pub fn upsert_document(&self, job_id: &str, doc: NewDocument<'_>) -> StoreResult<(String, bool)> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM documents WHERE job_id = ?1 AND content_hash = ?2",
                params![job_id, doc.content_hash],
                |row| row.get(0),
            )
            .optional()?;
        let now = ts(Utc::now());
        if let Some(doc_id) = existing {
            conn.execute(
                "UPDATE documents SET last_seen_at = ?1, version = version + 1 WHERE id = ?2",
                params![now, doc_id],
            )?;
            return Ok((doc_id, false));
        }
        let doc_id = format!("doc_{}", &Uuid::new_v4().simple().to_string()[..16]);
        conn.execute(
            "INSERT INTO documents (
                id, job_id, content_hash, title_hash, primary_url, primary_canonical,
                title, language, doc_type, quality_score, quality_passed,
                first_seen_at, last_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                doc_id,
                job_id,
                doc.content_hash,
                doc.title_hash,
                doc.url,
                doc.canonical_url,
                doc.title,
                doc.language,
                doc.doc_type,
                doc.quality_score,
                doc.quality_passed as i64,
                now,
            ],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO document_urls
             (document_id, job_id, url, canonical_url, match_reason, is_primary, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                doc_id,
                job_id,
                doc.url,
                doc.canonical_url,
                AliasReason::Canonical.as_str(),
                now,
            ],
        )?;
        Ok((doc_id, true))
    }

    /// Attach a URL alias to an existing document. Duplicate canonicals are
    /// ignored.
    pub fn attach_url_alias(
        &self,
        document_id: &str,
        job_id: &str,
        url: &str,
        canonical_url: &str,
        reason: AliasReason,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO document_urls
             (document_id, job_id, url, canonical_url, match_reason, is_primary, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                document_id,
                job_id,
                url,
                canonical_url,
                reason.as_str(),
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn find_document_by_hash(
        &self,
        job_id: &str,
        content_hash: &str,
    ) -> StoreResult<Option<Document>> {
        let conn = self.conn.lock();
        let doc = conn
            .query_row(
                &format!(
                    "SELECT {} FROM documents WHERE job_id = ?1 AND content_hash = ?2",
                    DOCUMENT_COLUMNS
                ),
                params![job_id, content_hash],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn document_aliases(&self, document_id: &str) -> StoreResult<Vec<DocumentUrl>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document_id, job_id, url, canonical_url, match_reason, is_primary, discovered_at
             FROM document_urls WHERE document_id = ?1 ORDER BY id ASC",
        )?;
        let aliases = stmt
            .query_map([document_id], |row| {
                Ok(DocumentUrl {
                    document_id: row.get(0)?,
                    job_id: row.get(1)?,
                    url: row.get(2)?,
                    canonical_url: row.get(3)?,
                    match_reason: AliasReason::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(AliasReason::ContentHash),
                    is_primary: row.get::<_, i64>(5)? != 0,
                    discovered_at: parse_ts_required(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    // ===== Events and artifacts =====

    pub fn log_event(
        &self,
        job_id: &str,
        level: EventLevel,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        Self::insert_event(&conn, job_id, level, event, data)
    }

    pub fn recent_events(&self, job_id: &str, limit: usize) -> StoreResult<Vec<JobEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, at, level, event, data FROM job_events
             WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![job_id, limit as i64], |row| {
                Ok(JobEvent {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    at: parse_ts_required(row.get(2)?),
                    level: row.get(3)?,
                    event: row.get(4)?,
                    data: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Register (or re-register) an output file. Finalization is idempotent,
    /// so the same kind replaces any previous row.
    pub fn create_artifact(
        &self,
        job_id: &str,
        kind: ArtifactKind,
        path: &str,
        byte_size: u64,
        sha256: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job_artifacts (job_id, kind, path, byte_size, sha256, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_id, kind) DO UPDATE SET
               path = excluded.path, byte_size = excluded.byte_size,
               sha256 = excluded.sha256, created_at = excluded.created_at",
            params![
                job_id,
                kind.as_str(),
                path,
                byte_size as i64,
                sha256,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn artifacts_for_job(&self, job_id: &str) -> StoreResult<Vec<JobArtifact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, kind, path, byte_size, sha256, created_at
             FROM job_artifacts WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let artifacts = stmt
            .query_map([job_id], |row| {
                Ok(JobArtifact {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    kind: ArtifactKind::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(ArtifactKind::SummaryJson),
                    path: row.get(3)?,
                    byte_size: row.get::<_, i64>(4)? as u64,
                    sha256: row.get(5)?,
                    created_at: parse_ts_required(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    // ===== Internal helpers =====

    fn release_expired_leases(
        conn: &Connection,
        job_id: Option<&str>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let now_s = ts(now);
        let (fail_sql, requeue_sql) = match job_id {
            Some(_) => (
                "UPDATE url_queue SET state = 'failed', last_error = 'lease_expired',
                 leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                 WHERE job_id = ?1 AND state = 'fetching' AND lease_expires_at < ?2
                   AND retry_count >= ?3",
                "UPDATE url_queue SET state = 'queued', retry_count = retry_count + 1,
                 leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                 WHERE job_id = ?1 AND state = 'fetching' AND lease_expires_at < ?2",
            ),
            None => (
                "UPDATE url_queue SET state = 'failed', last_error = 'lease_expired',
                 leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                 WHERE state = 'fetching' AND lease_expires_at < ?1 AND retry_count >= ?2",
                "UPDATE url_queue SET state = 'queued', retry_count = retry_count + 1,
                 leased_at = NULL, leased_by = NULL, lease_expires_at = NULL
                 WHERE state = 'fetching' AND lease_expires_at < ?1",
            ),
        };
        let mut released = 0usize;
        match job_id {
            Some(id) => {
                released += conn.execute(fail_sql, params![id, now_s, max_retries])?;
                released += conn.execute(requeue_sql, params![id, now_s])?;
            }
            None => {
                released += conn.execute(fail_sql, params![now_s, max_retries])?;
                released += conn.execute(requeue_sql, params![now_s])?;
            }
        }
        Ok(released as u64)
    }

    fn insert_event(
        conn: &Connection,
        job_id: &str,
        level: EventLevel,
        event: &str,
        data: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO job_events (job_id, at, level, event, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                ts(Utc::now()),
                level.as_str(),
                event,
                data.map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    fn job_by_id(conn: &Connection, job_id: &str) -> StoreResult<Option<Job>> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn entry_by_id(conn: &Connection, entry_id: i64) -> StoreResult<Option<FrontierEntry>> {
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM url_queue WHERE id = ?1", ENTRY_COLUMNS),
                [entry_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }
}

const JOB_COLUMNS: &str = "id, token_hash, start_url, allowed_host, max_pages, timeout_seconds,
    ignore_path_prefixes, use_js, state, cancel_requested, pages_fetched, pages_exported,
    errors_count, restart_count, site_status, block_evidence, last_error, crawler_strategy,
    created_at, started_at, finished_at, expires_at, heartbeat_at, last_progress_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let ignore_prefixes: String = row.get(6)?;
    Ok(Job {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        spec: JobSpec {
            start_url: row.get(2)?,
            allowed_host: row.get(3)?,
            max_pages: row.get::<_, i64>(4)? as u64,
            timeout_seconds: row.get::<_, i64>(5)? as u64,
            ignore_path_prefixes: serde_json::from_str(&ignore_prefixes).unwrap_or_default(),
            use_js: row.get::<_, i64>(7)? != 0,
        },
        state: JobState::parse(&row.get::<_, String>(8)?).unwrap_or(JobState::Failed),
        cancel_requested: row.get::<_, i64>(9)? != 0,
        pages_fetched: row.get::<_, i64>(10)? as u64,
        pages_exported: row.get::<_, i64>(11)? as u64,
        errors_count: row.get::<_, i64>(12)? as u64,
        restart_count: row.get::<_, i64>(13)? as u32,
        site_status: SiteStatus::parse(&row.get::<_, String>(14)?).unwrap_or(SiteStatus::Unknown),
        block_evidence: row
            .get::<_, Option<String>>(15)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        last_error: row.get(16)?,
        crawler_strategy: row.get(17)?,
        created_at: parse_ts_required(row.get(18)?),
        started_at: parse_ts(row.get(19)?),
        finished_at: parse_ts(row.get(20)?),
        expires_at: parse_ts_required(row.get(21)?),
        heartbeat_at: parse_ts(row.get(22)?),
        last_progress_at: parse_ts(row.get(23)?),
    })
}

const ENTRY_COLUMNS: &str = "id, job_id, url, canonical_url, state, depth, priority, retry_count,
    last_error, last_status_code, discovered_at, leased_at, leased_by, lease_expires_at,
    earliest_visible_at, fetched_at, parsed_at, stored_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<FrontierEntry> {
    Ok(FrontierEntry {
        id: row.get(0)?,
        job_id: row.get(1)?,
        url: row.get(2)?,
        canonical_url: row.get(3)?,
        state: UrlState::parse(&row.get::<_, String>(4)?).unwrap_or(UrlState::Failed),
        depth: row.get::<_, i64>(5)? as u32,
        priority: row.get(6)?,
        retry_count: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        last_status_code: row.get::<_, Option<i64>>(9)?.map(|v| v as u16),
        discovered_at: parse_ts_required(row.get(10)?),
        leased_at: parse_ts(row.get(11)?),
        leased_by: row.get(12)?,
        lease_expires_at: parse_ts(row.get(13)?),
        earliest_visible_at: parse_ts(row.get(14)?),
        fetched_at: parse_ts(row.get(15)?),
        parsed_at: parse_ts(row.get(16)?),
        stored_at: parse_ts(row.get(17)?),
    })
}

const DOCUMENT_COLUMNS: &str = "id, job_id, content_hash, title_hash, primary_url,
    primary_canonical, title, language, doc_type, quality_score, quality_passed,
    first_seen_at, last_seen_at, version";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        job_id: row.get(1)?,
        content_hash: row.get(2)?,
        title_hash: row.get(3)?,
        primary_url: row.get(4)?,
        primary_canonical: row.get(5)?,
        title: row.get(6)?,
        language: row.get(7)?,
        doc_type: row.get(8)?,
        quality_score: row.get(9)?,
        quality_passed: row.get::<_, i64>(10)? != 0,
        first_seen_at: parse_ts_required(row.get(11)?),
        last_seen_at: parse_ts_required(row.get(12)?),
        version: row.get::<_, i64>(13)? as u32,
    })
}
