//! Job finalization
//!
//! Runs once a job reaches `finalizing` (or was cancelled with partial
//! output): deduplicates the raw page stream by content hash, writes the
//! final corpus files and the knowledge-base directory, registers every
//! output as a downloadable artifact, and lands the job in its terminal
//! state. Re-running on the same job produces the same artifact set, so a
//! finalizer interrupted by a crash is safe to repeat.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::records::{
    append_jsonl, read_raw_records, CrawlSummary, ErrorTypeCount, KbManifest, KbManifestEntry,
    PageRecord, RawPageRecord,
};
use crate::store::{StateUpdate, Store};
use crate::types::{ArtifactKind, EventLevel, Job, JobState};
use crate::util::{kb_slug, sha256_hex};

/// Deduplicate, write outputs, register artifacts, and close out the job.
pub fn finalize_job(store: &Store, config: &Config, job_id: &str) -> Result<()> {
    let job = store
        .get_job(job_id)?
        .with_context(|| format!("job not found: {}", job_id))?;

    info!(job = %job_id, "Starting finalization");

    let job_dir = config.output_dir.join(job_id);
    std::fs::create_dir_all(&job_dir)?;
    let raw_path = job_dir.join("pages.raw.jsonl");
    let pages_path = job_dir.join("pages.jsonl");
    let summary_path = job_dir.join("summary.json");
    let kb_dir = job_dir.join("kb");

    let records = if raw_path.exists() {
        read_raw_records(&raw_path)?
    } else {
        Vec::new()
    };

    let groups = group_by_content_hash(&records);

    // pages.jsonl: one line per distinct exported document, first-seen order.
    let mut pages_file = BufWriter::new(File::create(&pages_path)?);
    for group in &groups {
        let mut aliases = group.aliases.clone();
        // Aliases observed live by the engine (redirects, language variants)
        // may not appear as raw records; merge them in from the store.
        if let Some(doc) = store.find_document_by_hash(job_id, &group.primary.content_hash)? {
            for alias in store.document_aliases(&doc.id)? {
                if !alias.is_primary
                    && alias.url != group.primary.url
                    && !aliases.contains(&alias.url)
                {
                    aliases.push(alias.url.clone());
                }
            }
        }
        let page = PageRecord::from_raw(group.primary.clone(), aliases);
        append_jsonl(&mut pages_file, &page)?;
    }
    pages_file.flush()?;

    let total_exported = groups.len() as u64;
    let summary = build_summary(store, &job, &records, total_exported)?;
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

    write_knowledge_base(store, job_id, &kb_dir, &groups)?;

    register_artifacts(store, job_id, &job_dir)?;

    store.log_event(
        job_id,
        EventLevel::Info,
        "finalize",
        Some(serde_json::json!({
            "pages_raw": records.len(),
            "pages_exported": total_exported,
            "duplicates_removed": records.iter().filter(|r| r.quality_passed).count() as u64
                - total_exported,
        })),
    )?;

    // Land the terminal state. A job already cancelled (zero-page cancel)
    // keeps its state; its counters are frozen.
    if job.state == JobState::Finalizing {
        let terminal = if job.cancel_requested {
            JobState::Cancelled
        } else {
            JobState::Done
        };
        store.set_state(
            job_id,
            terminal,
            StateUpdate {
                pages_exported: Some(total_exported),
                ..Default::default()
            },
        )?;
    }

    info!(
        job = %job_id,
        exported = total_exported,
        raw = records.len(),
        "Finalization complete"
    );
    Ok(())
}

struct ContentGroup {
    primary: RawPageRecord,
    aliases: Vec<String>,
}

/// Group passed records by content hash. The first record producing a hash
/// is the group's primary; later URLs become aliases. Groups come out in
/// first-seen order.
fn group_by_content_hash(records: &[RawPageRecord]) -> Vec<ContentGroup> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, ContentGroup> = HashMap::new();

    for record in records.iter().filter(|r| r.quality_passed) {
        match groups.get_mut(record.content_hash.as_str()) {
            Some(group) => {
                if record.url != group.primary.url && !group.aliases.contains(&record.url) {
                    group.aliases.push(record.url.clone());
                }
            }
            None => {
                order.push(record.content_hash.as_str());
                groups.insert(
                    record.content_hash.as_str(),
                    ContentGroup {
                        primary: record.clone(),
                        aliases: Vec::new(),
                    },
                );
            }
        }
    }

    let mut result: Vec<ContentGroup> = order
        .into_iter()
        .filter_map(|hash| groups.remove(hash))
        .collect();
    result.sort_by_key(|g| g.primary.extracted_at);
    result
}

fn build_summary(
    store: &Store,
    job: &Job,
    records: &[RawPageRecord],
    total_exported: u64,
) -> Result<CrawlSummary> {
    let mut histogram: BTreeMap<u16, u64> = BTreeMap::new();
    for record in records {
        *histogram.entry(record.status_code).or_insert(0) += 1;
    }

    let top_error_types = store
        .error_summary(&job.id, 10)?
        .into_iter()
        .map(|(error, count)| ErrorTypeCount { error, count })
        .collect();

    let finished_at = Utc::now();
    let elapsed_seconds = job
        .started_at
        .map(|start| (finished_at - start).num_seconds())
        .unwrap_or(0);

    Ok(CrawlSummary {
        job_id: job.id.clone(),
        start_url: job.spec.start_url.clone(),
        allowed_host: job.spec.allowed_host.clone(),
        total_fetched: records.len() as u64,
        total_exported,
        total_errors: job.errors_count,
        site_status: job.site_status,
        started_at: job.started_at,
        finished_at,
        elapsed_seconds,
        status_code_histogram: histogram,
        top_error_types,
        crawler_strategy: job.crawler_strategy.clone(),
        fallback_occurred: job.crawler_strategy.as_deref() == Some("http_fallback_render"),
        restart_count: job.restart_count,
        block_evidence: job.block_evidence.clone(),
    })
}

/// Write one Markdown file per exported document plus the manifest.
fn write_knowledge_base(
    store: &Store,
    job_id: &str,
    kb_dir: &Path,
    groups: &[ContentGroup],
) -> Result<()> {
    std::fs::create_dir_all(kb_dir)?;

    let mut manifest_pages = Vec::with_capacity(groups.len());
    let mut used_slugs = HashSet::new();

    for (index, group) in groups.iter().enumerate() {
        let record = &group.primary;
        let doc_id = store
            .find_document_by_hash(job_id, &record.content_hash)?
            .map(|d| d.id)
            .unwrap_or_else(|| format!("page_{:04}", index + 1));

        let mut slug = kb_slug(&record.title, &doc_id);
        // Hash suffixes make collisions unlikely; handle them anyway.
        while !used_slugs.insert(slug.clone()) {
            slug.push('x');
        }
        let filename = format!("{}.md", slug);
        write_markdown_page(&kb_dir.join(&filename), record)?;

        manifest_pages.push(KbManifestEntry {
            id: doc_id,
            filename: filename.clone(),
            source_url: record.url.clone(),
            title: record.title.clone(),
            text_length: record.text.len(),
            content_hash: record.content_hash.clone(),
        });
    }

    let manifest = KbManifest {
        job_id: job_id.to_string(),
        generated_at: Utc::now(),
        format_version: "1.0".to_string(),
        total_pages: manifest_pages.len(),
        pages: manifest_pages,
    };
    std::fs::write(
        kb_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    Ok(())
}

fn write_markdown_page(path: &Path, record: &RawPageRecord) -> Result<()> {
    let title = if record.title.is_empty() {
        "Untitled"
    } else {
        &record.title
    };
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("title: \"{}\"\n", escape_yaml(title)));
    out.push_str(&format!("url: \"{}\"\n", record.url));
    out.push_str(&format!("content_hash: \"{}\"\n", record.content_hash));
    out.push_str("---\n\n");
    out.push_str(&format!("# {}\n\n", title));
    out.push_str(&record.text);
    out.push_str("\n\n---\n");
    out.push_str(&format!("*Source: [{}]({})*\n", record.url, record.url));

    let mut file = File::create(path)?;
    file.write_all(out.as_bytes())?;
    Ok(())
}

fn escape_yaml(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ")
}

/// Register every output file, with sha256 checksums.
fn register_artifacts(store: &Store, job_id: &str, job_dir: &Path) -> Result<()> {
    let outputs = [
        (ArtifactKind::PagesRawJsonl, job_dir.join("pages.raw.jsonl")),
        (ArtifactKind::PagesJsonl, job_dir.join("pages.jsonl")),
        (ArtifactKind::SummaryJson, job_dir.join("summary.json")),
        (ArtifactKind::KbManifest, job_dir.join("kb/manifest.json")),
    ];
    for (kind, path) in outputs {
        if !path.exists() {
            continue;
        }
        match std::fs::read(&path) {
            Ok(bytes) => {
                store.create_artifact(
                    job_id,
                    kind,
                    &path.to_string_lossy(),
                    bytes.len() as u64,
                    Some(&sha256_hex(&bytes)),
                )?;
            }
            Err(e) => warn!("Failed to read artifact {}: {}", path.display(), e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobSpec;
    use chrono::Duration;

    fn raw(url: &str, hash: &str, passed: bool, at_offset: i64) -> RawPageRecord {
        RawPageRecord {
            url: url.to_string(),
            canonical_url: url.to_string(),
            status_code: 200,
            depth: 0,
            title: format!("Title {}", url),
            text: format!("Body for {}", hash),
            outlinks: vec![],
            extracted_at: Utc::now() + Duration::seconds(at_offset),
            quality_score: if passed { 0.9 } else { 0.2 },
            quality_passed: passed,
            content_hash: hash.to_string(),
        }
    }

    fn setup(records: &[RawPageRecord]) -> (Store, Config, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output_dir = dir.path().to_path_buf();

        let store = Store::open_in_memory().unwrap();
        let job = store
            .create_job(
                JobSpec {
                    start_url: "http://example.test/".to_string(),
                    allowed_host: "example.test".to_string(),
                    max_pages: 100,
                    timeout_seconds: 1800,
                    ignore_path_prefixes: vec![],
                    use_js: false,
                },
                "tok",
                24,
            )
            .unwrap();
        store.claim_next_queued_job("w").unwrap();
        store
            .set_state(&job.id, JobState::Finalizing, StateUpdate::default())
            .unwrap();

        let job_dir = dir.path().join(&job.id);
        std::fs::create_dir_all(&job_dir).unwrap();
        let mut file = File::create(job_dir.join("pages.raw.jsonl")).unwrap();
        for record in records {
            append_jsonl(&mut file, record).unwrap();
        }
        (store, config, job.id, dir)
    }

    #[test]
    fn groups_dedupe_and_alias() {
        let records = vec![
            raw("http://example.test/a", "sha256:one", true, 0),
            raw("http://example.test/b", "sha256:one", true, 1),
            raw("http://example.test/c", "sha256:two", true, 2),
        ];
        let groups = group_by_content_hash(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].primary.url, "http://example.test/a");
        assert_eq!(groups[0].aliases, vec!["http://example.test/b"]);
        assert!(groups[1].aliases.is_empty());
    }

    #[test]
    fn failed_records_are_not_exported() {
        let records = vec![
            raw("http://example.test/a", "sha256:one", true, 0),
            raw("http://example.test/bad", "sha256:junk", false, 1),
        ];
        let groups = group_by_content_hash(&records);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn finalize_writes_outputs_and_lands_done() {
        let records = vec![
            raw("http://example.test/a", "sha256:one", true, 0),
            raw("http://example.test/b", "sha256:one", true, 1),
            raw("http://example.test/c", "sha256:two", true, 2),
        ];
        let (store, config, job_id, _dir) = setup(&records);
        finalize_job(&store, &config, &job_id).unwrap();

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.pages_exported, 2);

        let job_dir = config.output_dir.join(&job_id);
        let pages = std::fs::read_to_string(job_dir.join("pages.jsonl")).unwrap();
        let lines: Vec<PageRecord> = pages
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].url_aliases, vec!["http://example.test/b"]);

        let summary: CrawlSummary =
            serde_json::from_str(&std::fs::read_to_string(job_dir.join("summary.json")).unwrap())
                .unwrap();
        assert_eq!(summary.total_fetched, 3);
        assert_eq!(summary.total_exported, 2);
        assert_eq!(summary.status_code_histogram.get(&200), Some(&3));

        let manifest: KbManifest = serde_json::from_str(
            &std::fs::read_to_string(job_dir.join("kb/manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.total_pages, 2);
        for entry in &manifest.pages {
            let page = std::fs::read_to_string(job_dir.join("kb").join(&entry.filename)).unwrap();
            assert!(page.starts_with("---\n"));
            assert!(page.contains(&entry.content_hash));
        }

        let artifacts = store.artifacts_for_job(&job_id).unwrap();
        assert_eq!(artifacts.len(), 4);
        assert!(artifacts.iter().all(|a| a.sha256.is_some() && a.byte_size > 0));
    }

    #[test]
    fn finalize_is_idempotent() {
        let records = vec![raw("http://example.test/a", "sha256:one", true, 0)];
        let (store, config, job_id, _dir) = setup(&records);
        finalize_job(&store, &config, &job_id).unwrap();
        let job_dir = config.output_dir.join(&job_id);
        let first = std::fs::read_to_string(job_dir.join("pages.jsonl")).unwrap();

        // Second run on a terminal job rewrites identical outputs.
        finalize_job(&store, &config, &job_id).unwrap();
        let second = std::fs::read_to_string(job_dir.join("pages.jsonl")).unwrap();
        assert_eq!(first, second);
        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(store.artifacts_for_job(&job_id).unwrap().len(), 4);
    }

    #[test]
    fn finalize_without_raw_file_lands_done_with_zero_pages() {
        let (store, config, job_id, _dir) = setup(&[]);
        std::fs::remove_file(config.output_dir.join(&job_id).join("pages.raw.jsonl")).unwrap();
        finalize_job(&store, &config, &job_id).unwrap();

        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.pages_exported, 0);
        let summary: CrawlSummary = serde_json::from_str(
            &std::fs::read_to_string(config.output_dir.join(&job_id).join("summary.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(summary.total_fetched, 0);
    }

    #[test]
    fn cancelled_flag_lands_cancelled() {
        let records = vec![raw("http://example.test/a", "sha256:one", true, 0)];
        let (store, config, job_id, _dir) = setup(&records);
        store.request_cancel(&job_id).unwrap();
        finalize_job(&store, &config, &job_id).unwrap();
        let job = store.get_job(&job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        // Partial results stay downloadable.
        assert!(!store.artifacts_for_job(&job_id).unwrap().is_empty());
    }
}
