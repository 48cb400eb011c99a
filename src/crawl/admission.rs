//! URL admission rules
//!
//! A discovered URL joins the frontier only if every rule holds. The page
//! budget is enforced separately by the engine against the store, since it
//! depends on live frontier counts.

use url::Url;

/// Why a URL was refused admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnsupportedScheme,
    ForeignHost,
    IgnoredPrefix(String),
    ExcludedExtension(String),
    DepthExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::ForeignHost => "foreign_host",
            Self::IgnoredPrefix(_) => "ignored_prefix",
            Self::ExcludedExtension(_) => "excluded_extension",
            Self::DepthExceeded => "depth_exceeded",
        }
    }
}

/// Per-job admission policy, fixed at engine start
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    allowed_host: String,
    ignore_prefixes: Vec<String>,
    excluded_extensions: Vec<String>,
    depth_limit: u32,
}

impl AdmissionPolicy {
    pub fn new(
        allowed_host: &str,
        ignore_prefixes: Vec<String>,
        excluded_extensions: Vec<String>,
        depth_limit: u32,
    ) -> Self {
        Self {
            allowed_host: allowed_host.to_lowercase(),
            ignore_prefixes,
            excluded_extensions,
            depth_limit,
        }
    }

    /// Check every admission rule for a URL at the given depth.
    pub fn admit(&self, url: &Url, depth: u32) -> Result<(), RejectReason> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RejectReason::UnsupportedScheme);
        }

        let host = url.host_str().unwrap_or_default().to_lowercase();
        if host != self.allowed_host {
            return Err(RejectReason::ForeignHost);
        }

        let path = url.path();
        if let Some(prefix) = self.ignore_prefixes.iter().find(|p| path.starts_with(p.as_str())) {
            return Err(RejectReason::IgnoredPrefix(prefix.clone()));
        }

        let path_lower = path.to_lowercase();
        if let Some(ext) = self
            .excluded_extensions
            .iter()
            .find(|e| path_lower.ends_with(e.as_str()))
        {
            return Err(RejectReason::ExcludedExtension(ext.clone()));
        }

        if depth > self.depth_limit {
            return Err(RejectReason::DepthExceeded);
        }

        Ok(())
    }
}
