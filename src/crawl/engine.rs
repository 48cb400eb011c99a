//! Per-job crawl engine
//!
//! Pulls leased URLs from the frontier, fans out concurrent fetch workers
//! behind a semaphore, pipes results through extraction and the quality
//! gate, enqueues admitted outlinks, and appends raw page records through a
//! single writer task. The engine owns backend selection and the one-way
//! HTTP-to-render fallback; the supervisor owns every other state
//! transition. The only transition the engine writes is
//! `running -> finalizing` on a normal exit.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, QualityConfig};
use crate::records::{append_jsonl, RawPageRecord};
use crate::store::{NewDocument, StateUpdate, Store, UrlOutcome};
use crate::types::{AliasReason, EventLevel, FrontierEntry, Job, JobState, SiteStatus};
use crate::util::{content_hash, fast_hash, title_hash};

use super::admission::AdmissionPolicy;
use super::blocking::BlockSignalTracker;
use super::browser::{RenderFetcher, RenderFetcherConfig};
use super::extractor::{DensityExtractor, Extraction, ExtractError, PageExtractor, ReadabilityExtractor};
use super::fetcher::{FetchOutcome, HttpFetcher, HttpFetcherConfig, PageFetcher};
use super::quality::{score_page, Verdict};
use super::{canonicalize_str, canonicalize_url};

/// Engine configuration, derived from the global config per job
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_id: String,
    pub job_dir: PathBuf,
    pub download_delay: Duration,
    pub heartbeat_interval: Duration,
    pub lease_ttl_secs: i64,
    pub drain_timeout: Duration,
    pub idle_poll: Duration,
    pub depth_limit: u32,
    pub max_retries: u32,
    pub fallback_min_fetches: u64,
    pub fallback_window: Duration,
    pub quality: QualityConfig,
    pub excluded_extensions: Vec<String>,
    pub user_agent: String,
    pub http_concurrency: usize,
    pub render_concurrency: usize,
    pub request_timeout: Duration,
    pub render_timeout: Duration,
    pub render_post_load_wait: Duration,
    pub render_endpoint: Option<String>,
    pub max_redirects: usize,
    pub max_content_size: usize,
}

impl EngineConfig {
    pub fn from_config(config: &Config, job: &Job) -> Self {
        Self {
            worker_id: format!("engine_{}", uuid::Uuid::new_v4().simple()),
            job_dir: config.output_dir.join(&job.id),
            download_delay: Duration::from_millis(config.crawler.download_delay_ms),
            heartbeat_interval: Duration::from_secs(config.worker.heartbeat_interval_secs),
            lease_ttl_secs: config.worker.lease_ttl_secs as i64,
            drain_timeout: Duration::from_secs(config.worker.drain_timeout_secs),
            idle_poll: Duration::from_millis(250),
            depth_limit: config.crawler.depth_limit,
            max_retries: config.worker.max_retries,
            fallback_min_fetches: config.crawler.fallback_min_fetches,
            fallback_window: Duration::from_secs(config.crawler.fallback_window_secs),
            quality: config.quality.clone(),
            excluded_extensions: config.crawler.excluded_extensions.clone(),
            user_agent: config.crawler.user_agent.clone(),
            http_concurrency: config.crawler.concurrent_requests,
            render_concurrency: config.crawler.render_concurrency,
            request_timeout: Duration::from_secs(config.crawler.request_timeout_secs),
            render_timeout: Duration::from_secs(config.crawler.render_timeout_secs),
            render_post_load_wait: Duration::from_millis(config.crawler.render_post_load_wait_ms),
            render_endpoint: config.crawler.render_endpoint.clone(),
            max_redirects: config.crawler.max_redirects,
            max_content_size: config.crawler.max_content_size,
        }
    }
}

/// How the engine finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// Normal exit (budget met, frontier empty, or cancel with pages > 0);
    /// the engine has already set the job to `finalizing`.
    Finished,
    /// Cancel observed before any page was fetched; the supervisor moves the
    /// job to `cancelled` and still runs finalization.
    Cancelled,
}

enum PhaseOutcome {
    Complete,
    Cancelled,
    SwitchToRender,
    SiteBlocked(String),
}

/// Per-job crawl engine
pub struct CrawlEngine {
    store: Arc<Store>,
    job: Job,
    config: EngineConfig,
    http: Arc<dyn PageFetcher>,
    render: Option<Arc<dyn PageFetcher>>,
}

struct Shared {
    store: Arc<Store>,
    config: EngineConfig,
    job: Job,
    admission: AdmissionPolicy,
    tracker: Mutex<BlockSignalTracker>,
    seen_urls: Mutex<HashSet<u64>>,
    errors_count: AtomicU64,
    cancel_seen: AtomicBool,
    fatal: Mutex<Option<String>>,
    record_tx: Mutex<Option<mpsc::Sender<RawPageRecord>>>,
}

impl Shared {
    fn set_fatal(&self, message: String) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(message);
        }
    }

    async fn send_record(&self, record: RawPageRecord) {
        let tx = self.record_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(record).await.is_err() {
                warn!("Raw record dropped: writer closed");
            }
        }
    }
}

impl CrawlEngine {
    /// Build an engine with the configured backends.
    pub fn new(store: Arc<Store>, job: Job, config: EngineConfig) -> anyhow::Result<Self> {
        let http: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(HttpFetcherConfig {
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout,
            connect_timeout: Duration::from_secs(10),
            max_redirects: config.max_redirects,
            max_content_size: config.max_content_size,
            concurrency: config.http_concurrency,
        })?);
        let render: Option<Arc<dyn PageFetcher>> = match &config.render_endpoint {
            Some(endpoint) => Some(Arc::new(RenderFetcher::new(RenderFetcherConfig {
                endpoint: endpoint.clone(),
                user_agent: config.user_agent.clone(),
                timeout: config.render_timeout,
                post_load_wait: config.render_post_load_wait,
                concurrency: config.render_concurrency,
            })?)),
            None => None,
        };
        Ok(Self::with_fetchers(store, job, config, http, render))
    }

    /// Build an engine with explicit backends (used by tests to inject
    /// scripted fetchers).
    pub fn with_fetchers(
        store: Arc<Store>,
        job: Job,
        config: EngineConfig,
        http: Arc<dyn PageFetcher>,
        render: Option<Arc<dyn PageFetcher>>,
    ) -> Self {
        Self {
            store,
            job,
            config,
            http,
            render,
        }
    }

    /// Run the crawl to completion.
    pub async fn run(self) -> anyhow::Result<EngineExit> {
        let job_id = self.job.id.clone();
        std::fs::create_dir_all(&self.config.job_dir)?;
        let raw_path = self.config.job_dir.join("pages.raw.jsonl");
        let initial_pages = count_lines(&raw_path);

        // Recover entries a previous engine left mid-pipeline.
        self.store.reset_nonterminal_entries(&job_id)?;

        // Seed the frontier.
        let start_url = self.job.spec.start_url.clone();
        let canonical = canonicalize_str(&start_url)
            .ok_or_else(|| anyhow::anyhow!("invalid start url: {}", start_url))?;
        self.store.enqueue_url(&job_id, &start_url, &canonical, 0, 0)?;

        // Backend selection.
        let start_host = Url::parse(&start_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        let js_reason = crate::config::detected_reason(&start_host);
        let start_with_render = self.job.spec.use_js || js_reason.is_some();

        let mut fetcher: Arc<dyn PageFetcher> = if start_with_render {
            if let Some(reason) = &js_reason {
                self.store.log_event(
                    &job_id,
                    EventLevel::Info,
                    "js_domain_detected",
                    Some(serde_json::json!({ "reason": reason })),
                )?;
            }
            self.render
                .clone()
                .ok_or_else(|| anyhow::anyhow!("render backend required but not configured"))?
        } else {
            Arc::clone(&self.http)
        };
        let mut strategy = if start_with_render {
            if self.job.spec.use_js {
                "render_user_requested"
            } else {
                "render_preemptive"
            }
        } else {
            "http"
        };
        self.store.set_crawler_strategy(&job_id, strategy)?;
        let mut fallback_armed = fetcher.label() == "http" && self.render.is_some();

        info!(
            job = %job_id,
            backend = fetcher.label(),
            "Starting crawl of {} (max_pages={})",
            start_url,
            self.job.spec.max_pages
        );

        // Single writer for the raw output file.
        let (record_tx, mut record_rx) = mpsc::channel::<RawPageRecord>(256);
        let pages_counter = Arc::new(AtomicU64::new(initial_pages));
        let writer_pages = Arc::clone(&pages_counter);
        let writer = tokio::spawn(async move {
            let mut file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&raw_path)
            {
                Ok(f) => f,
                Err(e) => {
                    warn!("Failed to open raw output file: {}", e);
                    return Err(anyhow::anyhow!("output file open failed: {}", e));
                }
            };
            while let Some(record) = record_rx.recv().await {
                append_jsonl(&mut file, &record)?;
                writer_pages.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });

        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            admission: AdmissionPolicy::new(
                &self.job.spec.allowed_host,
                self.job.spec.ignore_path_prefixes.clone(),
                self.config.excluded_extensions.clone(),
                self.config.depth_limit,
            ),
            job: self.job.clone(),
            tracker: Mutex::new(BlockSignalTracker::new()),
            seen_urls: Mutex::new(HashSet::new()),
            errors_count: AtomicU64::new(0),
            cancel_seen: AtomicBool::new(false),
            fatal: Mutex::new(None),
            record_tx: Mutex::new(Some(record_tx)),
        });
        // The writer owns the real page count (records actually on disk).
        // Route reads through it.
        let crawl_start = Instant::now();
        let crawl_timeout = Duration::from_secs(self.job.spec.timeout_seconds.max(1));

        let result: anyhow::Result<EngineExit> = loop {
            let outcome = run_phase(
                Arc::clone(&shared),
                Arc::clone(&fetcher),
                Arc::clone(&pages_counter),
                fallback_armed,
                crawl_start,
                crawl_timeout,
            )
            .await;

            match outcome {
                Err(message) => break Err(anyhow::anyhow!(message)),
                Ok(PhaseOutcome::Complete) => break Ok(EngineExit::Finished),
                Ok(PhaseOutcome::Cancelled) => {
                    if pages_counter.load(Ordering::Relaxed) == 0 {
                        break Ok(EngineExit::Cancelled);
                    }
                    break Ok(EngineExit::Finished);
                }
                Ok(PhaseOutcome::SiteBlocked(reason)) => break Err(anyhow::anyhow!(reason)),
                Ok(PhaseOutcome::SwitchToRender) => {
                    let render = match self.render.clone() {
                        Some(r) => r,
                        None => {
                            // Cannot switch; keep crawling on HTTP without
                            // re-evaluating the trigger.
                            warn!(job = %job_id, "Fallback wanted but no render backend configured");
                            let _ = self.store.log_event(
                                &job_id,
                                EventLevel::Warn,
                                "fallback_unavailable",
                                None,
                            );
                            fallback_armed = false;
                            continue;
                        }
                    };
                    let evidence = shared.tracker.lock().evidence();
                    let switched = self
                        .store
                        .reset_nonterminal_entries(&job_id)
                        .and_then(|reset| {
                            self.store.update_site_status(
                                &job_id,
                                SiteStatus::SwitchedToJs,
                                Some(evidence),
                            )?;
                            self.store
                                .set_crawler_strategy(&job_id, "http_fallback_render")?;
                            self.store.log_event(
                                &job_id,
                                EventLevel::Info,
                                "fallback_triggered",
                                Some(serde_json::json!({
                                    "from": "http", "to": "render", "entries_requeued": reset
                                })),
                            )?;
                            Ok(reset)
                        });
                    match switched {
                        Ok(reset) => {
                            info!(
                                job = %job_id,
                                "Switching to render backend ({} entries requeued)", reset
                            );
                            strategy = "http_fallback_render";
                            *shared.tracker.lock() = BlockSignalTracker::new();
                            fetcher = render;
                            fallback_armed = false;
                            continue;
                        }
                        Err(e) => break Err(anyhow::anyhow!("fallback switch failed: {}", e)),
                    }
                }
            }
        };

        finish_writer(&shared, writer).await;

        // Flush final counters before handing over to the finalizer.
        let _ = self.store.heartbeat(
            &job_id,
            pages_counter.load(Ordering::Relaxed),
            shared.errors_count.load(Ordering::Relaxed),
        );

        let exit = result?;
        if exit == EngineExit::Finished {
            self.store
                .set_state(&job_id, JobState::Finalizing, StateUpdate::default())?;
        }
        info!(job = %job_id, ?exit, strategy, "Crawl engine finished");
        Ok(exit)
    }
}

/// Close the record channel and wait for the writer to drain.
async fn finish_writer(shared: &Arc<Shared>, writer: tokio::task::JoinHandle<anyhow::Result<()>>) {
    shared.record_tx.lock().take();
    match tokio::time::timeout(Duration::from_secs(10), writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("Raw output writer failed: {}", e),
        Ok(Err(e)) => warn!("Raw output writer panicked: {}", e),
        Err(_) => warn!("Raw output writer did not drain in time"),
    }
}

/// One crawl phase under a single backend.
async fn run_phase(
    shared: Arc<Shared>,
    fetcher: Arc<dyn PageFetcher>,
    pages_counter: Arc<AtomicU64>,
    fallback_armed: bool,
    crawl_start: Instant,
    crawl_timeout: Duration,
) -> Result<PhaseOutcome, String> {
    let job_id = shared.job.id.clone();
    let semaphore = Arc::new(Semaphore::new(fetcher.concurrency().max(1)));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let phase_start = Instant::now();
    let mut last_status = SiteStatus::Unknown;

    // Heartbeat + cancel observer.
    let hb_shared = Arc::clone(&shared);
    let hb_pages = Arc::clone(&pages_counter);
    let heartbeat = tokio::spawn(async move {
        loop {
            let pages = hb_pages.load(Ordering::Relaxed);
            let errors = hb_shared.errors_count.load(Ordering::Relaxed);
            if let Err(e) = hb_shared.store.heartbeat(&hb_shared.job.id, pages, errors) {
                hb_shared.set_fatal(format!("heartbeat write failed: {}", e));
            }
            match hb_shared.store.get_job(&hb_shared.job.id) {
                Ok(Some(job)) => {
                    if job.cancel_requested {
                        hb_shared.cancel_seen.store(true, Ordering::Relaxed);
                    }
                }
                Ok(None) => hb_shared.set_fatal("job row disappeared".to_string()),
                Err(e) => hb_shared.set_fatal(format!("job read failed: {}", e)),
            }
            tokio::time::sleep(hb_shared.config.heartbeat_interval).await;
        }
    });

    let outcome = loop {
        if let Some(message) = shared.fatal.lock().clone() {
            break Err(message);
        }
        if shared.cancel_seen.load(Ordering::Relaxed) {
            break Ok(PhaseOutcome::Cancelled);
        }
        if pages_counter.load(Ordering::Relaxed) >= shared.job.spec.max_pages {
            debug!(job = %job_id, "Page budget met");
            break Ok(PhaseOutcome::Complete);
        }
        if crawl_start.elapsed() >= crawl_timeout {
            info!(job = %job_id, "Crawl timeout reached");
            break Ok(PhaseOutcome::Complete);
        }

        // Site status bookkeeping and fallback / blocked evaluation.
        {
            let tracker = shared.tracker.lock();
            let status = tracker.site_status();
            if status != last_status && tracker.total_recorded() > 0 {
                last_status = status;
                let _ = shared.store.update_site_status(
                    &job_id,
                    status,
                    Some(tracker.evidence()),
                );
                if status != SiteStatus::Normal {
                    let _ = shared.store.log_event(
                        &job_id,
                        EventLevel::Warn,
                        "blocked_detected",
                        Some(tracker.evidence()),
                    );
                }
            }

            let window_open = tracker.total_recorded() >= shared.config.fallback_min_fetches
                || (phase_start.elapsed() >= shared.config.fallback_window
                    && tracker.total_recorded() > 0);
            if window_open {
                if fallback_armed {
                    let no_usable_text =
                        tracker.passed_count() == 0 && tracker.mean_text_len() < 200.0;
                    let blocked = matches!(
                        status,
                        SiteStatus::Blocked | SiteStatus::LoginRequired
                    );
                    let duplicated = tracker.duplicate_ratio() > 0.5;
                    if no_usable_text || blocked || duplicated {
                        break Ok(PhaseOutcome::SwitchToRender);
                    }
                } else if fetcher.label() == "render"
                    && matches!(status, SiteStatus::Blocked | SiteStatus::LoginRequired)
                {
                    break Ok(PhaseOutcome::SiteBlocked(format!(
                        "site_{}_under_render_backend",
                        status.as_str()
                    )));
                }
            }
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break Ok(PhaseOutcome::Complete),
        };

        let leased = match shared.store.lease_urls(
            &job_id,
            &shared.config.worker_id,
            1,
            chrono::Duration::seconds(shared.config.lease_ttl_secs),
            shared.config.max_retries,
            Utc::now(),
        ) {
            Ok(entries) => entries,
            Err(e) => {
                break Err(format!("frontier lease failed: {}", e));
            }
        };

        match leased.into_iter().next() {
            Some(entry) => {
                in_flight.fetch_add(1, Ordering::SeqCst);
                let task_shared = Arc::clone(&shared);
                let task_fetcher = Arc::clone(&fetcher);
                let task_in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let _permit = permit;
                    process_entry(task_shared, task_fetcher, entry).await;
                    task_in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            None => {
                drop(permit);
                let pending = match shared.store.pending_entry_count(&job_id) {
                    Ok(n) => n,
                    Err(e) => break Err(format!("frontier poll failed: {}", e)),
                };
                if in_flight.load(Ordering::SeqCst) == 0 && pending == 0 {
                    debug!(job = %job_id, "Frontier exhausted");
                    break Ok(PhaseOutcome::Complete);
                }
                tokio::time::sleep(shared.config.idle_poll).await;
            }
        }
    };

    // Drain in-flight work, bounded; abandoned leases recover via TTL.
    let deadline = Instant::now() + shared.config.drain_timeout;
    while in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    heartbeat.abort();

    outcome
}

/// Process one leased frontier entry end to end.
async fn process_entry(shared: Arc<Shared>, fetcher: Arc<dyn PageFetcher>, entry: FrontierEntry) {
    tokio::time::sleep(shared.config.download_delay).await;

    let url = match Url::parse(&entry.url) {
        Ok(u) => u,
        Err(e) => {
            shared.fail_entry(&entry, None, format!("invalid_url:{}", e));
            return;
        }
    };

    let outcome = match fetcher.fetch(&url).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_transient() => {
            shared.retry_entry(&entry, None, format!("fetch_error:{}", e));
            return;
        }
        Err(e) => {
            shared.fail_entry(&entry, None, format!("fetch_error:{}", e));
            return;
        }
    };

    let status = outcome.status_code;
    let final_path = outcome.final_url.path().to_string();

    if status == 429 || (500..600).contains(&status) {
        shared.record_fetch(&entry.url, status, Some(&outcome.body), &final_path, None, false, 0);
        shared.retry_entry(&entry, Some(status), format!("server_error:{}", status));
        return;
    }
    if (400..500).contains(&status) {
        shared.record_fetch(&entry.url, status, Some(&outcome.body), &final_path, None, false, 0);
        shared.fail_entry(&entry, Some(status), format!("http_status:{}", status));
        return;
    }

    // A redirect may have moved the page out of scope; skip it but keep the
    // final path visible to the login-redirect detector.
    let final_canonical = canonicalize_url(&outcome.final_url);
    if final_canonical != entry.canonical_url {
        if shared.admission.admit(&outcome.final_url, entry.depth).is_err() {
            shared.record_fetch(&entry.url, status, None, &final_path, None, false, 0);
            shared.complete(
                &entry,
                UrlOutcome::Skipped {
                    reason: "redirect_out_of_scope".to_string(),
                },
            );
            return;
        }
    }

    shared.complete(&entry, UrlOutcome::Fetched { status_code: status });

    // Extraction is CPU-bound; keep it off the async workers.
    let body = outcome.body.clone();
    let base_url = outcome.final_url.clone();
    let quality = shared.config.quality.clone();
    let extraction = tokio::task::spawn_blocking(move || {
        let html_len = body.len();
        match ReadabilityExtractor.extract(&body, &base_url) {
            Ok(ext) => {
                let report = score_page(&ext.text, ext.outlinks.len(), html_len, &quality);
                if report.verdict == Verdict::Marginal {
                    // One shot with the alternate extractor; keep the
                    // better-scoring result.
                    if let Ok(alt) = DensityExtractor.extract(&body, &base_url) {
                        let alt_report =
                            score_page(&alt.text, alt.outlinks.len(), html_len, &quality);
                        if alt_report.score > report.score {
                            return Ok::<_, ExtractError>((alt, alt_report, "density"));
                        }
                    }
                }
                Ok((ext, report, "readability"))
            }
            Err(_) => {
                // Extraction cascade: the alternate gets a chance before the
                // page is written off.
                let alt = DensityExtractor.extract(&body, &base_url)?;
                let report = score_page(&alt.text, alt.outlinks.len(), html_len, &quality);
                Ok((alt, report, "density"))
            }
        }
    })
    .await;

    let (extraction, report, mode) = match extraction {
        Ok(Ok(result)) => result,
        Ok(Err(_)) | Err(_) => {
            // Extraction failure is a quality failure, not a fetch error.
            shared.record_fetch(&entry.url, status, Some(&outcome.body), &final_path, None, false, 0);
            shared.complete(&entry, UrlOutcome::Parsed);
            shared
                .send_record(build_record(&entry, &outcome, "", "", Vec::new(), 0.0, false))
                .await;
            shared.complete(&entry, UrlOutcome::Stored);
            return;
        }
    };

    let hash = content_hash(&extraction.text);
    let passed = report.verdict == Verdict::Pass;
    shared.complete(&entry, UrlOutcome::Parsed);
    debug!(
        url = %entry.url,
        score = report.score,
        mode,
        passed,
        reason = report.reason.as_deref().unwrap_or(""),
        "Extracted {} chars",
        extraction.text.len()
    );

    if passed {
        let document = NewDocument {
            content_hash: &hash,
            title_hash: title_hash(&extraction.title),
            url: &entry.url,
            canonical_url: &entry.canonical_url,
            title: &extraction.title,
            language: extraction.language.as_deref(),
            doc_type: "article",
            quality_score: report.score,
            quality_passed: true,
        };
        match shared.store.upsert_document(&shared.job.id, document) {
            Ok((doc_id, is_new)) => {
                if !is_new {
                    let _ = shared.store.attach_url_alias(
                        &doc_id,
                        &shared.job.id,
                        &entry.url,
                        &entry.canonical_url,
                        AliasReason::ContentHash,
                    );
                }
            }
            Err(e) => shared.set_fatal(format!("document upsert failed: {}", e)),
        }
    }

    shared.record_fetch(
        &entry.url,
        status,
        Some(&outcome.body),
        &final_path,
        Some(hash.clone()),
        passed,
        extraction.text.len(),
    );

    // Outlinks feed the frontier even on quality failure, unless the site
    // looks blocked.
    let site_blocked = shared.tracker.lock().site_status() == SiteStatus::Blocked;
    if !site_blocked {
        shared.enqueue_outlinks(&extraction, entry.depth);
    }

    shared
        .send_record(build_record(
            &entry,
            &outcome,
            &extraction.title,
            &extraction.text,
            extraction
                .outlinks
                .iter()
                .map(|u| u.as_str().to_string())
                .collect(),
            report.score,
            passed,
        ))
        .await;
    shared.complete(&entry, UrlOutcome::Stored);
}

fn build_record(
    entry: &FrontierEntry,
    outcome: &FetchOutcome,
    title: &str,
    text: &str,
    outlinks: Vec<String>,
    score: f64,
    passed: bool,
) -> RawPageRecord {
    RawPageRecord {
        url: entry.url.clone(),
        canonical_url: entry.canonical_url.clone(),
        status_code: outcome.status_code,
        depth: entry.depth,
        title: title.to_string(),
        text: text.to_string(),
        outlinks,
        extracted_at: Utc::now(),
        quality_score: score,
        quality_passed: passed,
        content_hash: content_hash(text),
    }
}

impl Shared {
    fn complete(&self, entry: &FrontierEntry, outcome: UrlOutcome) {
        if let Err(e) = self.store.complete_url(entry.id, outcome) {
            self.set_fatal(format!("frontier update failed: {}", e));
        }
    }

    fn fail_entry(&self, entry: &FrontierEntry, status: Option<u16>, error: String) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
        self.complete(
            entry,
            UrlOutcome::Failed {
                status_code: status,
                error,
            },
        );
    }

    fn retry_entry(&self, entry: &FrontierEntry, status: Option<u16>, error: String) {
        let abandoned = entry.retry_count >= self.config.max_retries;
        if abandoned {
            self.errors_count.fetch_add(1, Ordering::Relaxed);
        }
        let backoff_secs = 2u64.saturating_pow(entry.retry_count).min(60);
        self.complete(
            entry,
            UrlOutcome::Retry {
                status_code: status,
                error,
                backoff: chrono::Duration::seconds(backoff_secs as i64),
                max_retries: self.config.max_retries,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn record_fetch(
        &self,
        url: &str,
        status: u16,
        body: Option<&str>,
        final_path: &str,
        hash: Option<String>,
        passed: bool,
        text_len: usize,
    ) {
        self.tracker
            .lock()
            .record(url, status, body, final_path, hash, passed, text_len);
    }

    fn enqueue_outlinks(&self, extraction: &Extraction, parent_depth: u32) {
        let depth = parent_depth + 1;
        for link in &extraction.outlinks {
            if self.admission.admit(link, depth).is_err() {
                continue;
            }
            let canonical = canonicalize_url(link);
            if !self.seen_urls.lock().insert(fast_hash(&canonical)) {
                continue;
            }
            // Budget cap: never queue more work than the job can export.
            match self.store.active_entry_count(&self.job.id) {
                Ok(active) if active >= self.job.spec.max_pages => break,
                Ok(_) => {}
                Err(e) => {
                    self.set_fatal(format!("frontier count failed: {}", e));
                    break;
                }
            }
            let priority = -(depth as i64);
            if let Err(e) =
                self.store
                    .enqueue_url(&self.job.id, link.as_str(), &canonical, depth, priority)
            {
                self.set_fatal(format!("enqueue failed: {}", e));
                break;
            }
        }
    }
}

fn count_lines(path: &std::path::Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count() as u64,
        Err(_) => 0,
    }
}
