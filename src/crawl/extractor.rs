//! Main-content extraction from HTML
//!
//! The primary extractor runs Mozilla's readability algorithm; when the
//! quality gate lands a page in the marginal band, the engine retries with
//! the density extractor, which walks known content containers instead.
//! Outlink harvesting always runs on the full document, not the cleaned
//! content, so navigation links still feed the frontier.

use scraper::{Html, Selector};
use std::collections::HashSet;
use std::io::Cursor;
use thiserror::Error;
use url::Url;

/// Errors from extraction
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no extractable content")]
    NoContent,
    #[error("extracted text is empty")]
    Empty,
}

/// Extracted page content
#[derive(Debug, Clone)]
pub struct Extraction {
    pub title: String,
    pub text: String,
    /// Fully-resolved absolute outlinks
    pub outlinks: Vec<Url>,
    pub language: Option<String>,
}

/// Contract for pluggable extractors.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, html: &str, base_url: &Url) -> Result<Extraction, ExtractError>;

    /// Label recorded with quality retries.
    fn mode(&self) -> &'static str;
}

/// Primary extractor built on the readability algorithm.
pub struct ReadabilityExtractor;

impl PageExtractor for ReadabilityExtractor {
    fn extract(&self, html: &str, base_url: &Url) -> Result<Extraction, ExtractError> {
        let mut cursor = Cursor::new(html.as_bytes());
        let product = readability::extractor::extract(&mut cursor, base_url)
            .map_err(|_| ExtractError::NoContent)?;

        let text = product.text.trim().to_string();
        if text.is_empty() {
            return Err(ExtractError::Empty);
        }

        let document = Html::parse_document(html);
        Ok(Extraction {
            title: product.title,
            text,
            outlinks: extract_outlinks(&document, base_url),
            language: extract_language(&document),
        })
    }

    fn mode(&self) -> &'static str {
        "readability"
    }
}

/// Selectors for main content, in priority order
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".post-content",
    ".article-content",
    ".entry-content",
    ".content",
    "#content",
];

/// Tags whose text never belongs to the main body
const CHROME_SELECTORS: &[&str] = &["nav", "header", "footer", "aside", "script", "style"];

/// Alternate extractor: picks the densest known content container and falls
/// back to the whole body.
pub struct DensityExtractor;

impl PageExtractor for DensityExtractor {
    fn extract(&self, html: &str, base_url: &Url) -> Result<Extraction, ExtractError> {
        let document = Html::parse_document(html);

        let chrome_text: HashSet<String> = CHROME_SELECTORS
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .flat_map(|sel| {
                document
                    .select(&sel)
                    .flat_map(|el| {
                        collect_text(&el)
                            .lines()
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut text = String::new();
        for selector_str in CONTENT_SELECTORS {
            if let Ok(selector) = Selector::parse(selector_str) {
                if let Some(element) = document.select(&selector).next() {
                    text = collect_text(&element);
                    if !text.is_empty() {
                        break;
                    }
                }
            }
        }

        if text.is_empty() {
            // Body fallback, minus navigation chrome.
            if let Ok(body_sel) = Selector::parse("body") {
                if let Some(body) = document.select(&body_sel).next() {
                    let full = collect_text(&body);
                    text = full
                        .split('\n')
                        .filter(|line| !chrome_text.contains(*line))
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
        }

        let text = normalize_whitespace(&text);
        if text.is_empty() {
            return Err(ExtractError::Empty);
        }

        Ok(Extraction {
            title: extract_title(&document).unwrap_or_default(),
            text,
            outlinks: extract_outlinks(&document, base_url),
            language: extract_language(&document),
        })
    }

    fn mode(&self) -> &'static str {
        "density"
    }
}

fn collect_text(element: &scraper::ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the document title.
pub fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Extract the declared document language, if any.
fn extract_language(document: &Html) -> Option<String> {
    let selector = Selector::parse("html").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("lang"))
        .map(|lang| lang.split('-').next().unwrap_or(lang).to_lowercase())
        .filter(|l| !l.is_empty())
}

/// Extract all http(s) outlinks, resolved against the base URL, deduplicated
/// in document order.
pub fn extract_outlinks(document: &Html, base_url: &Url) -> Vec<Url> {
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            if let Ok(url) = base_url.join(href) {
                if matches!(url.scheme(), "http" | "https")
                    && seen.insert(url.as_str().to_string())
                {
                    urls.push(url);
                }
            }
        }
    }
    urls
}
