//! Sitemap/seed web crawl (spec §4.2, Data Model §3 Page). The BFS walk and
//! `reqwest` client setup follow `cuemap::agent::ingester::process_url_recursive`;
//! sitemap discovery follows
//! `original_source/onekey_rag_service/crawler/sitemap.py`.

use super::extractor::extract_readable;
use crate::error::{AppError, AppResult};
use crate::store::types::Page;
use crate::store::Store;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const USER_AGENT: &str = "chainrag/0.1 (+https://example.invalid; docs indexer)";
const MAX_NESTED_SITEMAPS: u8 = 20;

const SKIP_EXTENSIONS: &[&str] = &[
    ".pdf", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".mp3", ".mp4", ".wav", ".avi", ".mov",
    ".zip", ".tar", ".gz", ".rar", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".css", ".js",
    ".json", ".xml", ".rss", ".atom",
];

#[derive(Clone, Debug, Default)]
pub struct CrawlOptions {
    pub sitemap_url: Option<String>,
    pub seed_urls: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_pages: usize,
    pub max_depth: u8,
    pub same_domain_only: bool,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct CrawlResult {
    pub pages_crawled: usize,
    pub links_found: usize,
    pub links_skipped: usize,
    pub errors: Vec<(String, String)>,
}

fn build_globset(patterns: &[String]) -> AppResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| AppError::Validation(format!("invalid pattern {pattern}: {e}")))?;
        builder.add(glob);
    }
    Ok(Some(builder.build().map_err(|e| AppError::Validation(e.to_string()))?))
}

fn normalize_url(raw: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(raw) {
        parsed.set_fragment(None);
        let mut s = parsed.to_string();
        if s.ends_with('/') && s.len() > 1 {
            s.pop();
        }
        s.to_lowercase()
    } else {
        raw.to_lowercase()
    }
}

fn is_non_html_resource(link: &str) -> bool {
    let lower = link.to_lowercase();
    SKIP_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn extract_links(doc: &scraper::Html, base: &url::Url) -> Vec<String> {
    let selector = scraper::Selector::parse("a[href]").unwrap();
    doc.select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|u| u.to_string())
        .collect()
}

/// Fetches every `<loc>` URL from a sitemap, recursing into nested
/// `<sitemap>` entries of a sitemap index up to `max_nested` levels deep.
pub async fn fetch_sitemap_urls(client: &reqwest::Client, sitemap_url: &str, max_nested: u8) -> AppResult<Vec<String>> {
    let mut urls = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back((sitemap_url.to_string(), 0u8));
    let mut visited = HashSet::new();

    while let Some((current, depth)) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let body = client
            .get(&current)
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("sitemap fetch {current}: {e}")))?
            .text()
            .await
            .map_err(|e| AppError::DependencyLogic(format!("sitemap read {current}: {e}")))?;

        let doc = roxmltree::Document::parse(&body)
            .map_err(|e| AppError::DependencyLogic(format!("sitemap xml {current}: {e}")))?;
        let root = doc.root_element();
        let is_index = root.tag_name().name().eq_ignore_ascii_case("sitemapindex");

        for node in root.children().filter(|n| n.is_element()) {
            let locs: Vec<String> = node
                .children()
                .filter(|n| n.tag_name().name().eq_ignore_ascii_case("loc"))
                .filter_map(|n| n.text())
                .map(|s| s.trim().to_string())
                .collect();
            for loc in locs {
                if (is_index || node.tag_name().name().eq_ignore_ascii_case("sitemap")) && depth < max_nested {
                    queue.push_back((loc, depth + 1));
                } else {
                    urls.push(loc);
                }
            }
        }
    }

    Ok(urls)
}

/// BFS crawl from seed URLs (and/or a sitemap), writing each page through
/// `Store::upsert_page`. Content hashing (spec §3 `Page.content_hash`) skips
/// re-chunking pages whose Markdown hasn't changed since the last crawl —
/// the caller (the `index` job) is responsible for the chunk/embed pass.
pub async fn crawl(store: &dyn Store, kb_id: Uuid, options: CrawlOptions) -> AppResult<CrawlResult> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| AppError::DependencyUnavailable(format!("http client: {e}")))?;

    let include = build_globset(&options.include_patterns)?;
    let exclude = build_globset(&options.exclude_patterns)?;

    let mut seeds = options.seed_urls.clone();
    if let Some(sitemap_url) = &options.sitemap_url {
        match fetch_sitemap_urls(&client, sitemap_url, MAX_NESTED_SITEMAPS).await {
            Ok(mut urls) => seeds.append(&mut urls),
            Err(e) => warn!("sitemap discovery failed for {}: {}", sitemap_url, e),
        }
    }
    if seeds.is_empty() {
        return Err(AppError::Validation("crawl requires seed_urls or a sitemap_url".into()));
    }

    let base_domain = url::Url::parse(&seeds[0])
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, u8)> = VecDeque::new();
    for seed in seeds {
        let normalized = normalize_url(&seed);
        if visited.insert(normalized) {
            queue.push_back((seed, 0));
        }
    }

    let mut result = CrawlResult::default();

    while let Some((current_url, depth)) = queue.pop_front() {
        if result.pages_crawled >= options.max_pages.max(1) {
            break;
        }
        if let Some(set) = &exclude {
            if set.is_match(&current_url) {
                result.links_skipped += 1;
                continue;
            }
        }
        if let Some(set) = &include {
            if !set.is_match(&current_url) {
                result.links_skipped += 1;
                continue;
            }
        }

        debug!(depth, url = %current_url, "crawling");
        let html = match client.get(&current_url).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    result.errors.push((current_url.clone(), format!("read error: {e}")));
                    continue;
                }
            },
            Err(e) => {
                result.errors.push((current_url.clone(), format!("fetch error: {e}")));
                continue;
            }
        };

        let extracted = extract_readable(&html);
        let mut hasher = Sha256::new();
        hasher.update(extracted.markdown.as_bytes());
        let content_hash = hex::encode(hasher.finalize());

        let page = Page {
            id: Uuid::new_v4(),
            kb_id,
            url: current_url.clone(),
            title: extracted.title,
            content_markdown: extracted.markdown,
            content_hash,
            indexed_content_hash: None,
            http_status: Some(200),
            last_crawled_at: Some(chrono::Utc::now()),
            meta: serde_json::json!({}),
        };
        store.upsert_page(page).await?;
        result.pages_crawled += 1;

        if depth < options.max_depth {
            if let Ok(parsed_current) = url::Url::parse(&current_url) {
                let doc = scraper::Html::parse_document(&html);
                let links = extract_links(&doc, &parsed_current);
                result.links_found += links.len();

                for link in links {
                    let normalized = normalize_url(&link);
                    if visited.contains(&normalized) {
                        result.links_skipped += 1;
                        continue;
                    }
                    if options.same_domain_only {
                        let same_domain = url::Url::parse(&link)
                            .map(|u| u.host_str().unwrap_or("") == base_domain)
                            .unwrap_or(false);
                        if !same_domain {
                            result.links_skipped += 1;
                            continue;
                        }
                    }
                    if is_non_html_resource(&link) {
                        result.links_skipped += 1;
                        continue;
                    }
                    visited.insert(normalized);
                    queue.push_back((link, depth + 1));
                }
            }
        }
    }

    info!(
        pages = result.pages_crawled,
        errors = result.errors.len(),
        "crawl complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_strips_fragment_and_trailing_slash() {
        assert_eq!(normalize_url("https://Example.com/Docs/#section"), "https://example.com/docs");
    }

    #[test]
    fn is_non_html_resource_detects_known_extensions() {
        assert!(is_non_html_resource("https://example.com/file.PDF"));
        assert!(!is_non_html_resource("https://example.com/docs/page"));
    }

    #[test]
    fn build_globset_matches_include_patterns() {
        let set = build_globset(&vec!["*/docs/*".to_string()]).unwrap().unwrap();
        assert!(set.is_match("https://example.com/docs/intro"));
        assert!(!set.is_match("https://example.com/blog/intro"));
    }
}
