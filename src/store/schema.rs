//! Database schema definitions
//!
//! All crawl state lives in SQLite: jobs, the URL frontier, deduplicated
//! documents with their URL aliases, the append-only event log, and
//! registered artifacts. The schema is idempotent so opening an existing
//! database is a no-op.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per crawl job
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL,
    start_url TEXT NOT NULL,
    allowed_host TEXT NOT NULL,
    max_pages INTEGER NOT NULL,
    timeout_seconds INTEGER NOT NULL,
    ignore_path_prefixes TEXT NOT NULL DEFAULT '[]',
    use_js INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    pages_exported INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    restart_count INTEGER NOT NULL DEFAULT 0,
    site_status TEXT NOT NULL DEFAULT 'unknown',
    block_evidence TEXT,
    last_error TEXT,
    crawler_strategy TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    expires_at TEXT NOT NULL,
    heartbeat_at TEXT,
    last_progress_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_expires ON jobs(expires_at);

-- URL frontier with lease bookkeeping
CREATE TABLE IF NOT EXISTS url_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    canonical_url TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'queued',
    depth INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_status_code INTEGER,
    discovered_at TEXT NOT NULL,
    leased_at TEXT,
    leased_by TEXT,
    lease_expires_at TEXT,
    earliest_visible_at TEXT,
    fetched_at TEXT,
    parsed_at TEXT,
    stored_at TEXT,
    UNIQUE(job_id, canonical_url)
);

CREATE INDEX IF NOT EXISTS idx_url_queue_job_state ON url_queue(job_id, state);
CREATE INDEX IF NOT EXISTS idx_url_queue_lease ON url_queue(state, lease_expires_at);

-- Deduplicated extracted content
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    content_hash TEXT NOT NULL,
    title_hash TEXT,
    primary_url TEXT NOT NULL,
    primary_canonical TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    language TEXT,
    doc_type TEXT NOT NULL DEFAULT 'article',
    quality_score REAL NOT NULL DEFAULT 0,
    quality_passed INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE(job_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_documents_job ON documents(job_id);

-- url -> document aliases
CREATE TABLE IF NOT EXISTS document_urls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    job_id TEXT NOT NULL,
    url TEXT NOT NULL,
    canonical_url TEXT NOT NULL,
    match_reason TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    discovered_at TEXT NOT NULL,
    UNIQUE(document_id, canonical_url)
);

CREATE INDEX IF NOT EXISTS idx_document_urls_doc ON document_urls(document_id);
CREATE INDEX IF NOT EXISTS idx_document_urls_job ON document_urls(job_id, canonical_url);

-- Append-only job event log
CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    at TEXT NOT NULL,
    level TEXT NOT NULL,
    event TEXT NOT NULL,
    data TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id, at);

-- Registered output files
CREATE TABLE IF NOT EXISTS job_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    path TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    sha256 TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(job_id, kind)
);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn schema_initializes() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(initialize_schema(&conn).is_ok());
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        assert!(initialize_schema(&conn).is_ok());
    }

    #[test]
    fn tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in [
            "jobs",
            "url_queue",
            "documents",
            "document_urls",
            "job_events",
            "job_artifacts",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {} should exist", table);
        }
    }
}
