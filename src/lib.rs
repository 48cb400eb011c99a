//! Skrapp: documentation-site crawler with a persistent job queue
//!
//! On demand, ingests a single website starting from a seed URL, extracts
//! main-body text from each page, deduplicates by content, and emits a JSONL
//! corpus plus a summary and a knowledge-base directory. Built around:
//! - a SQLite store holding jobs, the lease-based URL frontier, documents,
//!   and events, so crashed workers resume from disk
//! - a per-job crawl engine with concurrent fetch workers, a quality gate,
//!   blocking detection, and an HTTP-to-browser-render fallback
//! - a supervisor loop that claims queued jobs, detects stuck ones, and
//!   drives finalization

pub mod config;
pub mod crawl;
pub mod records;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;

pub use config::Config;
pub use store::Store;
pub use types::*;
