//! Crawl pipeline: admission, fetching, extraction, quality, blocking, engine
//!
//! Key components:
//! - `canonicalize_url`: the deterministic dedup key for the frontier
//! - `AdmissionPolicy`: scheme/host/prefix/extension/depth gate
//! - `PageFetcher`: contract shared by the HTTP and browser-render backends
//! - `PageExtractor`: main-content extraction with an alternate for retries
//! - quality gate and blocking-signal tracker
//! - `CrawlEngine`: the per-job worker that ties the pipeline together

pub mod admission;
pub mod blocking;
pub mod browser;
pub mod engine;
pub mod extractor;
pub mod fetcher;
pub mod quality;

pub use admission::{AdmissionPolicy, RejectReason};
pub use blocking::BlockSignalTracker;
pub use browser::RenderFetcher;
pub use engine::{CrawlEngine, EngineConfig, EngineExit};
pub use extractor::{DensityExtractor, Extraction, PageExtractor, ReadabilityExtractor};
pub use fetcher::{FetchError, FetchOutcome, HttpFetcher, PageFetcher};
pub use quality::{score_page, QualityReport, Verdict};

use url::Url;

/// Canonicalize a URL into the frontier dedup key.
///
/// - Lowercases scheme and host (the url crate already stores both lowered)
/// - Drops the fragment
/// - Drops the default port
/// - Drops the query string entirely
/// - Collapses duplicate slashes in the path
/// - Folds a trailing `/index.html` or `/index.htm` into the directory
/// - Strips the trailing slash except at the root
///
/// The operation is idempotent: `canonicalize_url` of its own output is a
/// fixed point.
pub fn canonicalize_url(url: &Url) -> String {
    let scheme = url.scheme().to_lowercase();
    let host = url.host_str().unwrap_or_default().to_lowercase();

    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    let port = match url.port() {
        Some(p) if Some(p) == default_port => None,
        other => other,
    };

    let mut path = String::with_capacity(url.path().len());
    let mut prev_slash = false;
    for c in url.path().chars() {
        if c == '/' {
            if !prev_slash {
                path.push(c);
            }
            prev_slash = true;
        } else {
            path.push(c);
            prev_slash = false;
        }
    }
    if path.is_empty() {
        path.push('/');
    }

    for index_page in ["/index.html", "/index.htm"] {
        if let Some(stripped) = path.strip_suffix(index_page) {
            path = format!("{}/", stripped);
            break;
        }
    }

    if path.len() > 1 && path.ends_with('/') {
        path.truncate(path.len() - 1);
    }

    match port {
        Some(p) => format!("{}://{}:{}{}", scheme, host, p, path),
        None => format!("{}://{}{}", scheme, host, path),
    }
}

/// Parse then canonicalize; `None` for unparseable input.
pub fn canonicalize_str(raw: &str) -> Option<String> {
    Url::parse(raw).ok().map(|u| canonicalize_url(&u))
}
