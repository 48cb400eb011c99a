//! Shared utility functions

use sha2::{Digest, Sha256};

/// Hash an arbitrary string with xxh3 (used for in-process seen-URL caches).
pub fn fast_hash(s: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(s.as_bytes())
}

/// Compute the content hash of extracted text.
///
/// The text is normalized first (lowercased, whitespace collapsed) so that
/// incidental formatting differences between two renderings of the same page
/// do not defeat deduplication. The result is prefixed with the algorithm
/// name so stored hashes stay self-describing.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    format!("sha256:{:x}", digest)
}

/// Compute the short title hash used as a secondary dedup hint.
pub fn title_hash(title: &str) -> Option<String> {
    let normalized = normalize_text(title);
    if normalized.is_empty() {
        return None;
    }
    let digest = Sha256::digest(normalized.as_bytes());
    Some(format!("{:x}", digest)[..16].to_string())
}

/// Lowercase and collapse all whitespace runs to single spaces.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the sha256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Build a filesystem-safe slug for a knowledge-base page from its title and
/// document id. The trailing hash fragment keeps slugs unique even when two
/// documents share a title.
pub fn kb_slug(title: &str, doc_id: &str) -> String {
    let mut base: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while base.contains("--") {
        base = base.replace("--", "-");
    }
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "untitled" } else { base };
    let mut end = base.len().min(60);
    while end > 0 && !base.is_char_boundary(end) {
        end -= 1;
    }
    let digest = Sha256::digest(format!("{}:{}", title, doc_id).as_bytes());
    let tail = format!("{:x}", digest);
    format!("{}-{}", &base[..end], &tail[..8])
}
