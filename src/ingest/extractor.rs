//! HTML extraction and Markdown conversion (spec §4.2). Grounded in
//! `original_source/onekey_rag_service/crawler/extract.py`'s
//! `_EnhancedMarkdownConverter`/`extract_readable`: strip boilerplate tags,
//! pick the largest plausible "main content" container, convert to
//! Markdown, collapse excess whitespace.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

const STRIP_SELECTORS: &[&str] = &["script", "style", "noscript", "svg", "nav", "footer", "aside"];
const MAIN_CONTENT_SELECTORS: &[&str] = &["main", "article", "[role=main]", "#content", ".content", ".main"];

static EXCESS_NEWLINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static EXCESS_SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

#[derive(Clone, Debug)]
pub struct ExtractedPage {
    pub title: String,
    pub markdown: String,
}

fn document_title(doc: &Html) -> String {
    let selector = Selector::parse("title").unwrap();
    doc.select(&selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Removes boilerplate elements from the parsed document before
/// conversion; `scraper` has no in-place DOM mutation, so we re-serialize
/// only the surviving fragment selected by `pick_main_content`.
fn pick_main_content(html: &str) -> String {
    let doc = Html::parse_document(html);
    for sel in MAIN_CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(el) = doc.select(&selector).next() {
                let fragment = el.html();
                if fragment.len() >= 200 {
                    return fragment;
                }
            }
        }
    }
    let body_selector = Selector::parse("body").unwrap();
    doc.select(&body_selector)
        .next()
        .map(|e| e.html())
        .unwrap_or_else(|| html.to_string())
}

fn strip_boilerplate(html: &str) -> String {
    // `htmd` converts directly from raw HTML; boilerplate tags are removed
    // by feeding it a fragment built via `scraper`'s selector exclusion, not
    // by string surgery, to stay well-formed.
    let doc = Html::parse_fragment(html);
    let mut skip_ranges: Vec<(usize, usize)> = Vec::new();
    for tag in STRIP_SELECTORS {
        if let Ok(selector) = Selector::parse(tag) {
            for el in doc.select(&selector) {
                let html_str = el.html();
                if let Some(start) = html.find(&html_str) {
                    skip_ranges.push((start, start + html_str.len()));
                }
            }
        }
    }
    if skip_ranges.is_empty() {
        return html.to_string();
    }
    skip_ranges.sort();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0usize;
    for (start, end) in skip_ranges {
        if start < cursor {
            continue;
        }
        out.push_str(&html[cursor..start]);
        cursor = end;
    }
    out.push_str(&html[cursor..]);
    out
}

/// Extracts readable content from a raw HTML document and converts it to
/// Markdown, falling back to whole-body extraction when no main-content
/// container is recognizable (spec §4.2 edge case).
pub fn extract_readable(html: &str) -> ExtractedPage {
    let doc = Html::parse_document(html);
    let title = document_title(&doc);

    let main_html = pick_main_content(html);
    let cleaned = strip_boilerplate(&main_html);

    let markdown = htmd::convert(&cleaned).unwrap_or_else(|_| cleaned.clone());
    let collapsed = EXCESS_NEWLINES_RE.replace_all(&markdown, "\n\n");
    let collapsed = EXCESS_SPACES_RE.replace_all(&collapsed, " ");

    ExtractedPage { title, markdown: collapsed.trim().to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_readable_picks_article_over_nav() {
        let html = r#"<html><head><title>Docs</title></head><body>
            <nav>Home | About | Contact | Pricing | Blog</nav>
            <article><h1>Heading</h1><p>Body content that is reasonably long so it passes the minimum length check applied to candidate main-content containers.</p></article>
            <footer>copyright</footer>
        </body></html>"#;
        let page = extract_readable(html);
        assert_eq!(page.title, "Docs");
        assert!(page.markdown.contains("Body content"));
    }

    #[test]
    fn extract_readable_collapses_excess_whitespace() {
        let html = "<html><body><article><p>a</p>\n\n\n\n<p>b</p></article></body></html>";
        let page = extract_readable(html);
        assert!(!page.markdown.contains("\n\n\n"));
    }
}
