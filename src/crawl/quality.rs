//! Content quality gate
//!
//! A cheap deterministic scalar decides whether an extracted page is worth
//! exporting. Three features, each in [0, 1], averaged:
//!
//! - text length, saturating at the success threshold
//! - link density, penalizing navigation-dominated pages
//! - text-to-HTML density, penalizing markup shells
//!
//! The verdict bands drive the engine: pass exports, marginal earns one
//! re-extraction with the alternate extractor, fail is dropped (outlinks are
//! still harvested either way).

use crate::config::QualityConfig;

/// Verdict bands over the scalar score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Exported; a document may be created
    Pass,
    /// Worth one re-extraction with the alternate extractor
    Marginal,
    /// Not exported
    Fail,
}

/// Quality assessment for one extracted page
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub score: f64,
    pub verdict: Verdict,
    /// Dominant failure, formatted `<feature>:<value>`
    pub reason: Option<String>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Score a page from its extracted text, outlink count, and raw HTML size.
pub fn score_page(
    text: &str,
    outlink_count: usize,
    html_len: usize,
    config: &QualityConfig,
) -> QualityReport {
    let text_len = text.len();
    let min_marginal = config.min_text_length_marginal as f64;
    let min_success = config.min_text_length_success as f64;

    let text_ok =
        ((text_len as f64 - min_marginal) / (min_success - min_marginal)).clamp(0.0, 1.0);
    let link_density_ok =
        1.0 - (outlink_count as f64 * 50.0 / text_len.max(1) as f64).min(1.0);
    let text_density_ok = (text_len as f64 / html_len.max(1) as f64 * 10.0).min(1.0);

    let score = (text_ok + link_density_ok + text_density_ok) / 3.0;

    let verdict = if score >= config.pass_threshold {
        Verdict::Pass
    } else if score >= config.marginal_threshold {
        Verdict::Marginal
    } else {
        Verdict::Fail
    };

    let reason = if verdict == Verdict::Pass {
        None
    } else {
        // Name the weakest feature.
        let mut features = [
            (
                text_ok,
                format!(
                    "text_too_short:{}<{}",
                    text_len, config.min_text_length_success
                ),
            ),
            (
                link_density_ok,
                format!(
                    "high_link_density:{:.2}",
                    (outlink_count as f64 * 50.0 / text_len.max(1) as f64).min(1.0)
                ),
            ),
            (
                text_density_ok,
                format!(
                    "low_text_density:{:.3}",
                    text_len as f64 / html_len.max(1) as f64
                ),
            ),
        ];
        features.sort_by(|a, b| a.0.total_cmp(&b.0));
        Some(features[0].1.clone())
    };

    QualityReport {
        score,
        verdict,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QualityConfig {
        QualityConfig::default()
    }

    #[test]
    fn rich_page_passes() {
        let text = "word ".repeat(200);
        let report = score_page(&text, 5, text.len() * 3, &config());
        assert_eq!(report.verdict, Verdict::Pass);
        assert!(report.score >= 0.6);
        assert!(report.reason.is_none());
    }

    #[test]
    fn empty_page_fails_with_length_reason() {
        let report = score_page("", 3, 1000, &config());
        assert_eq!(report.verdict, Verdict::Fail);
        let reason = report.reason.unwrap();
        assert!(reason.starts_with("text_too_short:0<200"), "got {}", reason);
    }

    #[test]
    fn text_feature_saturates_at_success_length() {
        let at_success = "x".repeat(200);
        let longer = "x".repeat(2000);
        let a = score_page(&at_success, 0, 400, &config());
        let b = score_page(&longer, 0, 4000, &config());
        // Same text_ok and text_density contributions, link term identical.
        assert!((a.score - b.score).abs() < 1e-9);
    }

    #[test]
    fn link_heavy_page_is_penalized() {
        let text = "x".repeat(300);
        let few_links = score_page(&text, 1, 600_000, &config());
        let many_links = score_page(&text, 30, 600_000, &config());
        assert!(many_links.score < few_links.score);
        assert_ne!(many_links.verdict, Verdict::Pass);
        assert!(many_links
            .reason
            .unwrap()
            .starts_with("high_link_density:"));
    }

    #[test]
    fn markup_shell_is_penalized() {
        let text = "x".repeat(150);
        let report = score_page(&text, 0, 600_000, &config());
        assert!(report.score < 0.6);
        assert!(report
            .reason
            .map(|r| r.starts_with("low_text_density:"))
            .unwrap_or(false));
    }

    #[test]
    fn marginal_band_sits_between_thresholds() {
        // Short-ish text with moderate density lands between 0.3 and 0.6.
        let text = "x".repeat(90);
        let report = score_page(&text, 1, 900, &config());
        assert!(
            report.score >= 0.3 && report.score < 0.6,
            "score {} should be marginal",
            report.score
        );
        assert_eq!(report.verdict, Verdict::Marginal);
    }

    #[test]
    fn score_matches_formula_exactly() {
        let text = "x".repeat(125); // halfway between 50 and 200
        let report = score_page(&text, 0, 12_500, &config());
        let text_ok = 0.5;
        let link_ok = 1.0;
        let density_ok: f64 = 125.0 / 12_500.0 * 10.0; // 0.1
        let expected = (text_ok + link_ok + density_ok) / 3.0;
        assert!((report.score - expected).abs() < 1e-9);
    }
}
