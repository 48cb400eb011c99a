//! End-to-end crawl scenarios against a scripted fetcher.
//!
//! Each scenario runs a real engine over the in-memory store with a mock
//! fetch backend, then finalizes and checks the corpus files, counters, and
//! terminal state.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skrapp::config::{Config, QualityConfig};
use skrapp::crawl::{
    canonicalize_str, CrawlEngine, EngineConfig, EngineExit, FetchError, FetchOutcome, PageFetcher,
};
use skrapp::records::{CrawlSummary, PageRecord};
use skrapp::store::Store;
use skrapp::types::{Job, JobSpec, JobState};
use skrapp::worker::finalize_job;
use url::Url;

#[derive(Clone)]
struct MockResponse {
    status: u16,
    body: String,
    final_url: Option<String>,
}

impl MockResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            final_url: None,
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            final_url: None,
        }
    }
}

/// Scripted fetch backend: per-URL response queues, the last response
/// repeats. Unknown URLs get a 404.
struct MockFetcher {
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    concurrency: usize,
    label: &'static str,
}

impl MockFetcher {
    fn new(label: &'static str, concurrency: usize) -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            concurrency,
            label,
        }
    }

    fn set(&self, url: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    fn set_sequence(&self, url: &str, responses: Vec<MockResponse>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let mut responses = self.responses.lock();
        let response = match responses.get_mut(url.as_str()) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| MockResponse::status(404)),
            None => MockResponse::status(404),
        };
        let final_url = response
            .final_url
            .map(|u| Url::parse(&u).unwrap())
            .unwrap_or_else(|| url.clone());
        Ok(FetchOutcome {
            final_url,
            status_code: response.status,
            headers: vec![],
            body: response.body,
            content_type: "text/html".to_string(),
            elapsed: Duration::from_millis(1),
            js_rendered: self.label == "render",
        })
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn label(&self) -> &'static str {
        self.label
    }
}

/// A content-rich page: long unique text plus links.
fn rich_page(title: &str, seed: &str, links: &[&str]) -> String {
    let text = format!("{} ", seed).repeat(60);
    let anchors: String = links
        .iter()
        .map(|l| format!("<a href=\"{}\">{}</a>", l, l))
        .collect();
    format!(
        "<html lang=\"en\"><head><title>{title}</title></head><body>\
         <article><h1>{title}</h1><p>{text}</p>{anchors}</article></body></html>"
    )
}

/// A thin page: too little text to pass the quality gate, padded with
/// markup so text density stays low.
fn thin_page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|l| format!("<a href=\"{}\">{}</a>", l, l))
        .collect();
    let padding = "<div class=\"spacer\"></div>".repeat(200);
    format!(
        "<html><head><title>{title}</title></head><body>\
         <article><p>loading</p>{anchors}</article>{padding}</body></html>"
    )
}

fn make_spec(max_pages: u64) -> JobSpec {
    JobSpec {
        start_url: "http://site.test/".to_string(),
        allowed_host: "site.test".to_string(),
        max_pages,
        timeout_seconds: 300,
        ignore_path_prefixes: vec![],
        use_js: false,
    }
}

fn engine_config(job: &Job, output_dir: &Path) -> EngineConfig {
    EngineConfig {
        worker_id: "test-worker".to_string(),
        job_dir: output_dir.join(&job.id),
        download_delay: Duration::from_millis(0),
        heartbeat_interval: Duration::from_millis(40),
        lease_ttl_secs: 30,
        drain_timeout: Duration::from_secs(5),
        idle_poll: Duration::from_millis(10),
        depth_limit: 20,
        max_retries: 3,
        fallback_min_fetches: 10,
        fallback_window: Duration::from_secs(30),
        quality: QualityConfig::default(),
        excluded_extensions: vec![".pdf".to_string(), ".png".to_string()],
        user_agent: "SkrappBot/1.0".to_string(),
        http_concurrency: 2,
        render_concurrency: 2,
        request_timeout: Duration::from_secs(5),
        render_timeout: Duration::from_secs(5),
        render_post_load_wait: Duration::from_millis(0),
        render_endpoint: None,
        max_redirects: 10,
        max_content_size: 10 * 1024 * 1024,
    }
}

struct Harness {
    store: Arc<Store>,
    config: Config,
    job: Job,
    _dir: tempfile::TempDir,
}

fn harness(max_pages: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.output_dir = dir.path().to_path_buf();

    let store = Arc::new(Store::open_in_memory().unwrap());
    store.create_job(make_spec(max_pages), "tok", 24).unwrap();
    let job = store.claim_next_queued_job("test-worker").unwrap().unwrap();

    Harness {
        store,
        config,
        job,
        _dir: dir,
    }
}

fn read_pages(config: &Config, job_id: &str) -> Vec<PageRecord> {
    let content =
        std::fs::read_to_string(config.output_dir.join(job_id).join("pages.jsonl")).unwrap();
    content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn read_summary(config: &Config, job_id: &str) -> CrawlSummary {
    serde_json::from_str(
        &std::fs::read_to_string(config.output_dir.join(job_id).join("summary.json")).unwrap(),
    )
    .unwrap()
}

// Scenario A: happy path over a small static site.
#[tokio::test]
async fn small_static_site_crawls_to_done() {
    let h = harness(100);
    let fetcher = Arc::new(MockFetcher::new("http", 2));
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "home welcome overview", &["/a", "/b"])),
    );
    fetcher.set(
        "http://site.test/a",
        MockResponse::ok(rich_page("Page A", "alpha install guide", &["/c"])),
    );
    fetcher.set(
        "http://site.test/b",
        MockResponse::ok(rich_page("Page B", "beta reference manual", &[])),
    );
    fetcher.set(
        "http://site.test/c",
        MockResponse::ok(rich_page("Page C", "gamma deep topic", &[])),
    );

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    let exit = engine.run().await.unwrap();
    assert_eq!(exit, EngineExit::Finished);

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Finalizing);
    assert_eq!(job.pages_fetched, 4);
    assert_eq!(job.errors_count, 0);

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.pages_exported, 4);

    let pages = read_pages(&h.config, &h.job.id);
    assert_eq!(pages.len(), 4);
    assert!(pages.iter().all(|p| p.quality_passed));

    let summary = read_summary(&h.config, &h.job.id);
    assert_eq!(summary.total_fetched, 4);
    assert_eq!(summary.total_exported, 4);
    assert_eq!(summary.total_errors, 0);
    assert_eq!(summary.status_code_histogram.get(&200), Some(&4));
}

// Scenario B: three URLs with byte-identical content collapse into one
// document with two aliases.
#[tokio::test]
async fn duplicate_content_collapses_to_one_document() {
    let h = harness(100);
    let fetcher = Arc::new(MockFetcher::new("http", 2));
    let same = rich_page("Same", "identical body text", &[]);
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "home hub overview", &["/x", "/y", "/z"])),
    );
    for path in ["/x", "/y", "/z"] {
        fetcher.set(
            &format!("http://site.test{}", path),
            MockResponse::ok(same.clone()),
        );
    }

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.pages_fetched, 4);

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
    // Home plus one document for the triplicated content.
    assert_eq!(job.pages_exported, 2);

    let pages = read_pages(&h.config, &h.job.id);
    let duplicated: Vec<_> = pages.iter().filter(|p| !p.url_aliases.is_empty()).collect();
    assert_eq!(duplicated.len(), 1);
    assert_eq!(duplicated[0].url_aliases.len(), 2);

    // Exactly one document row carries that content hash.
    let doc = h
        .store
        .find_document_by_hash(&h.job.id, &duplicated[0].content_hash)
        .unwrap()
        .unwrap();
    let aliases = h.store.document_aliases(&doc.id).unwrap();
    assert_eq!(aliases.len(), 3); // primary + two aliases
}

// Scenario C: 503 twice then 200 retries to success with no errors counted.
#[tokio::test]
async fn transient_server_errors_retry_then_succeed() {
    let h = harness(10);
    let fetcher = Arc::new(MockFetcher::new("http", 1));
    fetcher.set_sequence(
        "http://site.test/",
        vec![
            MockResponse::status(503),
            MockResponse::status(503),
            MockResponse::ok(rich_page("Home", "finally worked fine", &[])),
        ],
    );

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    let exit = engine.run().await.unwrap();
    assert_eq!(exit, EngineExit::Finished);

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.pages_fetched, 1);
    assert_eq!(job.errors_count, 0);

    let canonical = canonicalize_str("http://site.test/").unwrap();
    let entry = h
        .store
        .frontier_entry_by_canonical(&h.job.id, &canonical)
        .unwrap()
        .unwrap();
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.last_status_code, Some(200));

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    assert_eq!(
        h.store.get_job(&h.job.id).unwrap().unwrap().state,
        JobState::Done
    );
}

// Retries are bounded: a URL that never recovers ends failed and counted.
#[tokio::test]
async fn persistent_server_errors_abandon_after_retries() {
    let h = harness(10);
    let fetcher = Arc::new(MockFetcher::new("http", 1));
    fetcher.set("http://site.test/", MockResponse::status(503));

    let mut engine_cfg = engine_config(&h.job, &h.config.output_dir);
    engine_cfg.max_retries = 1;
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.pages_fetched, 0);
    assert_eq!(job.errors_count, 1);

    let canonical = canonicalize_str("http://site.test/").unwrap();
    let entry = h
        .store
        .frontier_entry_by_canonical(&h.job.id, &canonical)
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, skrapp::types::UrlState::Failed);
}

// Scenario D: cancellation mid-crawl preserves completed output.
#[tokio::test]
async fn cancel_mid_crawl_preserves_partial_results() {
    let h = harness(200);
    let fetcher = Arc::new(MockFetcher::new("http", 2));
    let links: Vec<String> = (1..100).map(|i| format!("/p{}", i)).collect();
    let link_refs: Vec<&str> = links.iter().map(String::as_str).collect();
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "front door", &link_refs)),
    );
    for (i, link) in links.iter().enumerate() {
        fetcher.set(
            &format!("http://site.test{}", link),
            MockResponse::ok(rich_page(
                &format!("Page {}", i),
                &format!("distinct body {}", i),
                &[],
            )),
        );
    }

    let mut engine_cfg = engine_config(&h.job, &h.config.output_dir);
    engine_cfg.download_delay = Duration::from_millis(15);
    let engine = CrawlEngine::with_fetchers(
        Arc::clone(&h.store),
        h.job.clone(),
        engine_cfg,
        fetcher,
        None,
    );

    let store = Arc::clone(&h.store);
    let job_id = h.job.id.clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        store.request_cancel(&job_id).unwrap();
    });

    let exit = engine.run().await.unwrap();
    canceller.await.unwrap();
    assert_eq!(exit, EngineExit::Finished);

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Finalizing);
    assert!(job.pages_fetched > 0);
    assert!(job.pages_fetched < 100, "cancel should stop the crawl early");

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    // Everything fetched before the cancel is exported, deduplicated.
    let pages = read_pages(&h.config, &h.job.id);
    assert_eq!(pages.len() as u64, job.pages_exported);
    assert!(!h.store.artifacts_for_job(&h.job.id).unwrap().is_empty());
}

// Empty bodies never export anything but the crawl still terminates.
#[tokio::test]
async fn empty_bodies_export_nothing() {
    let h = harness(10);
    let fetcher = Arc::new(MockFetcher::new("http", 1));
    fetcher.set("http://site.test/", MockResponse::ok(""));

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.pages_exported, 0);
    let summary = read_summary(&h.config, &h.job.id);
    assert_eq!(summary.total_exported, 0);
}

// Scenario F: thin HTTP results trigger the one-way switch to the render
// backend, which then produces a real corpus.
#[tokio::test]
async fn thin_http_results_fall_back_to_render_backend() {
    let h = harness(100);

    let links: Vec<String> = (1..30).map(|i| format!("/p{}", i)).collect();
    let link_refs: Vec<&str> = links.iter().map(String::as_str).collect();

    let http = Arc::new(MockFetcher::new("http", 1));
    http.set(
        "http://site.test/",
        MockResponse::ok(thin_page("Home", &link_refs)),
    );
    for link in &links {
        http.set(
            &format!("http://site.test{}", link),
            MockResponse::ok(thin_page(link, &[])),
        );
    }

    let render = Arc::new(MockFetcher::new("render", 2));
    render.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "rendered home content", &link_refs)),
    );
    for (i, link) in links.iter().enumerate() {
        render.set(
            &format!("http://site.test{}", link),
            MockResponse::ok(rich_page(
                &format!("Rendered {}", i),
                &format!("rendered body {}", i),
                &[],
            )),
        );
    }

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let render_backend: Arc<dyn PageFetcher> = render;
    let engine = CrawlEngine::with_fetchers(
        Arc::clone(&h.store),
        h.job.clone(),
        engine_cfg,
        http,
        Some(render_backend),
    );
    let exit = engine.run().await.unwrap();
    assert_eq!(exit, EngineExit::Finished);

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.crawler_strategy.as_deref(), Some("http_fallback_render"));

    let events = h.store.recent_events(&h.job.id, 100).unwrap();
    assert!(events.iter().any(|e| e.event == "fallback_triggered"));

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Done);
    assert!(job.pages_exported > 0, "render phase should export pages");

    let summary = read_summary(&h.config, &h.job.id);
    assert!(summary.fallback_occurred);
}

// Invariant: re-finalizing under a fixed fetcher script yields the same
// deduplicated corpus.
#[tokio::test]
async fn finalization_is_deterministic_for_same_crawl() {
    let h = harness(100);
    let fetcher = Arc::new(MockFetcher::new("http", 2));
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "stable content here", &["/a"])),
    );
    fetcher.set(
        "http://site.test/a",
        MockResponse::ok(rich_page("A", "more stable content", &[])),
    );

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let first = std::fs::read_to_string(
        h.config.output_dir.join(&h.job.id).join("pages.jsonl"),
    )
    .unwrap();
    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let second = std::fs::read_to_string(
        h.config.output_dir.join(&h.job.id).join("pages.jsonl"),
    )
    .unwrap();
    assert_eq!(first, second);
}

// Invariant: pages_exported <= pages_fetched <= max_pages under a tight
// budget.
#[tokio::test]
async fn page_budget_caps_the_crawl() {
    let h = harness(3);
    let fetcher = Arc::new(MockFetcher::new("http", 1));
    let links: Vec<String> = (1..20).map(|i| format!("/p{}", i)).collect();
    let link_refs: Vec<&str> = links.iter().map(String::as_str).collect();
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page("Home", "budget test home", &link_refs)),
    );
    for (i, link) in links.iter().enumerate() {
        fetcher.set(
            &format!("http://site.test{}", link),
            MockResponse::ok(rich_page(
                &format!("P{}", i),
                &format!("unique page {}", i),
                &[],
            )),
        );
    }

    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert!(job.pages_fetched <= 3, "fetched {} > budget", job.pages_fetched);
    assert!(job.pages_exported <= job.pages_fetched);

    // The frontier never admitted more work than the budget either.
    assert!(h.store.active_entry_count(&h.job.id).unwrap() <= 3);
}

// Invariant: frontier keeps one entry per canonical URL even when pages
// link to each other with fragments and trailing slashes.
#[tokio::test]
async fn canonical_dedup_holds_across_link_variants() {
    let h = harness(20);
    let fetcher = Arc::new(MockFetcher::new("http", 2));
    fetcher.set(
        "http://site.test/",
        MockResponse::ok(rich_page(
            "Home",
            "home content",
            &["/docs", "/docs/", "/docs#intro", "/docs?ref=nav"],
        )),
    );
    fetcher.set(
        "http://site.test/docs",
        MockResponse::ok(rich_page("Docs", "documentation index", &[])),
    );
    // The variants would 404 if fetched; canonical dedup keeps them out.
    let engine_cfg = engine_config(&h.job, &h.config.output_dir);
    let engine =
        CrawlEngine::with_fetchers(Arc::clone(&h.store), h.job.clone(), engine_cfg, fetcher, None);
    engine.run().await.unwrap();

    let job = h.store.get_job(&h.job.id).unwrap().unwrap();
    assert_eq!(job.pages_fetched, 2);
    assert_eq!(job.errors_count, 0);
    assert_eq!(h.store.active_entry_count(&h.job.id).unwrap(), 2);

    finalize_job(&h.store, &h.config, &h.job.id).unwrap();
    let pages = read_pages(&h.config, &h.job.id);
    let urls: HashSet<_> = pages.iter().map(|p| p.canonical_url.clone()).collect();
    assert_eq!(urls.len(), 2);
}
