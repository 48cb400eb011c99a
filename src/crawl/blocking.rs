//! Blocking signal detection
//!
//! Tracks a rolling window over the last completed fetches and derives the
//! job's site status from status codes, CAPTCHA/WAF signatures, login
//! redirects, and duplicate-content ratio. The engine reads the verdict to
//! decide on backend fallback or job failure.

use serde_json::json;
use std::collections::VecDeque;

use crate::types::SiteStatus;

/// Rolling window size, in completed fetches
pub const WINDOW_SIZE: usize = 50;

/// Body signatures indicating a CAPTCHA or WAF interstitial
const CAPTCHA_SIGNATURES: &[&str] = &[
    "cf-browser-verification",
    "cf-challenge",
    "checking your browser",
    "g-recaptcha",
    "recaptcha/api",
    "hcaptcha",
    "challenge-platform",
    "verify you are human",
    "verify you are not a robot",
    "please complete the security check",
    "access denied",
    "web application firewall",
    "mod_security",
    "request blocked",
    "sucuri",
    "incapsula",
    "akamai",
    "imperva",
];

/// Path fragments indicating a login redirect
const LOGIN_PATH_FRAGMENTS: &[&str] = &[
    "/login", "/signin", "/sign-in", "/auth", "/sso", "/oauth",
];

#[derive(Debug, Clone)]
struct FetchSample {
    status_code: u16,
    captcha: bool,
    login_redirect: bool,
    content_hash: Option<String>,
    passed: bool,
    text_len: usize,
}

/// Rolling tracker over the last `WINDOW_SIZE` completed fetches
#[derive(Debug, Default)]
pub struct BlockSignalTracker {
    window: VecDeque<FetchSample>,
    total_recorded: u64,
    signature_hits: Vec<String>,
    sample_urls: Vec<String>,
}

impl BlockSignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed fetch.
    ///
    /// `content_hash`, `passed`, and `text_len` describe the extraction
    /// result when one exists; error responses pass `None`/`false`/`0`.
    pub fn record(
        &mut self,
        url: &str,
        status_code: u16,
        body: Option<&str>,
        final_path: &str,
        content_hash: Option<String>,
        passed: bool,
        text_len: usize,
    ) {
        let captcha = body.map(|b| self.detect_captcha(b)).unwrap_or(false);
        let login_redirect = Self::is_login_path(final_path);
        if (captcha || login_redirect) && self.sample_urls.len() < 5 {
            self.sample_urls.push(url.to_string());
        }

        self.window.push_back(FetchSample {
            status_code,
            captcha,
            login_redirect,
            content_hash,
            passed,
            text_len,
        });
        if self.window.len() > WINDOW_SIZE {
            self.window.pop_front();
        }
        self.total_recorded += 1;
    }

    fn detect_captcha(&mut self, body: &str) -> bool {
        let body_lower = body.to_lowercase();
        let mut hit = false;
        for signature in CAPTCHA_SIGNATURES {
            if body_lower.contains(signature) {
                hit = true;
                if !self.signature_hits.iter().any(|s| s == signature) {
                    self.signature_hits.push(signature.to_string());
                }
            }
        }
        hit
    }

    fn is_login_path(path: &str) -> bool {
        let path_lower = path.to_lowercase();
        LOGIN_PATH_FRAGMENTS.iter().any(|f| path_lower.contains(f))
    }

    /// Completed fetches recorded since the crawl (or phase) started.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    /// Count of 429/403 responses in the window.
    pub fn block_429_403(&self) -> usize {
        self.window
            .iter()
            .filter(|s| matches!(s.status_code, 429 | 403))
            .count()
    }

    /// Count of CAPTCHA/WAF hits in the window.
    pub fn captcha_hits(&self) -> usize {
        self.window.iter().filter(|s| s.captcha).count()
    }

    /// Count of login redirects in the window.
    pub fn login_redirects(&self) -> usize {
        self.window.iter().filter(|s| s.login_redirect).count()
    }

    /// Duplicate-content ratio among passed extractions in the window.
    pub fn duplicate_ratio(&self) -> f64 {
        let hashes: Vec<&String> = self
            .window
            .iter()
            .filter(|s| s.passed)
            .filter_map(|s| s.content_hash.as_ref())
            .collect();
        if hashes.is_empty() {
            return 0.0;
        }
        let total = hashes.len();
        let unique = hashes.iter().collect::<std::collections::HashSet<_>>().len();
        1.0 - unique as f64 / total as f64
    }

    /// Count of passed extractions in the window.
    pub fn passed_count(&self) -> usize {
        self.window.iter().filter(|s| s.passed).count()
    }

    /// Mean extracted text length over the window.
    pub fn mean_text_len(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: usize = self.window.iter().map(|s| s.text_len).sum();
        sum as f64 / self.window.len() as f64
    }

    /// Derive the site status from the window counters.
    pub fn site_status(&self) -> SiteStatus {
        let blocked = self.block_429_403();
        if blocked > 10 || self.captcha_hits() > 2 {
            SiteStatus::Blocked
        } else if self.login_redirects() > 5 {
            SiteStatus::LoginRequired
        } else if blocked > 3 {
            SiteStatus::Throttled
        } else {
            SiteStatus::Normal
        }
    }

    /// Evidence payload recorded on the job row.
    pub fn evidence(&self) -> serde_json::Value {
        json!({
            "window": self.window.len(),
            "total_recorded": self.total_recorded,
            "block_429_403": self.block_429_403(),
            "captcha_hits": self.captcha_hits(),
            "login_redirects": self.login_redirects(),
            "duplicate_ratio": (self.duplicate_ratio() * 1000.0).round() / 1000.0,
            "signature_hits": self.signature_hits.clone(),
            "sample_urls": self.sample_urls.clone(),
        })
    }
}
