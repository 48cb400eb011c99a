//! Known JS-heavy domain patterns for backend preselection
//!
//! Hosts matching these patterns get the browser-render backend from the
//! start instead of waiting for the HTTP fetcher to come back empty.

/// Glob-style host patterns that typically require JavaScript rendering
const JS_DOMAIN_PATTERNS: &[&str] = &[
    // Help desk / support platforms
    "*.zendesk.com",
    "*.freshdesk.com",
    "*.intercom.help",
    "*.helpscoutdocs.com",
    "*.helpjuice.com",
    "*.document360.io",
    // Documentation platforms
    "*.gitbook.io",
    "*.readme.io",
    "*.notion.site",
    "*.slite.com",
    "*.archbee.io",
    "*.mintlify.app",
    "*.docusaurus.io",
    // SPA hosting platforms
    "*.vercel.app",
    "*.netlify.app",
    "*.pages.dev",
    // Specific help centers that require JS
    "help-center.talenta.co",
];

/// Check whether a hostname matches a glob-style pattern.
/// `*.example.com` matches `sub.example.com` and `example.com` itself.
fn matches_pattern(hostname: &str, pattern: &str) -> bool {
    if let Some(base) = pattern.strip_prefix("*.") {
        hostname == base || hostname.ends_with(&format!(".{}", base))
    } else {
        hostname == pattern
    }
}

/// Whether the host is known to require JavaScript rendering.
pub fn is_js_heavy_host(hostname: &str) -> bool {
    detected_reason(hostname).is_some()
}

/// The matching pattern, as logged in the `js_domain_detected` event.
pub fn detected_reason(hostname: &str) -> Option<String> {
    let hostname = hostname.to_lowercase();
    JS_DOMAIN_PATTERNS
        .iter()
        .find(|p| matches_pattern(&hostname, p))
        .map(|p| format!("domain_pattern:{}", p))
}
