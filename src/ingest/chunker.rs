//! Header-aware Markdown chunker with contract-address preprocessing
//! (spec §4.1). Grounded in
//! `original_source/onekey_rag_service/indexing/chunking.py`'s hand-written
//! fallback path — we always take that path; spec §9 explicitly asks not to
//! depend on a particular splitter library.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static CONTRACT_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)0x[a-f0-9]{40}").unwrap());

static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,3})\s+(.*)$").unwrap());

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkItem {
    pub section_path: String,
    pub text: String,
}

/// Finds every `0x[a-fA-F0-9]{40}` address in `text`, and if any are found
/// appends a synthetic `[CONTRACT_ADDRESSES]` trailer block listing them in
/// **sorted**, lowercased order — so a chunk remains findable by a plain
/// full-text search over an address even when the address only appears
/// inside a link target or table cell that the tokenizer would otherwise
/// split oddly.
pub fn preprocess_for_search(text: &str) -> String {
    let mut addresses: Vec<String> = CONTRACT_ADDRESS_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    if addresses.is_empty() {
        return text.to_string();
    }
    addresses.sort();
    addresses.dedup();
    let block = addresses.join("\n");
    format!("{text}\n\n[CONTRACT_ADDRESSES]\n{block}")
}

/// Content-addresses a chunk or page body for change detection
/// (`Chunk.chunk_hash`, `Page.content_hash`).
pub fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Splits `text` into chunks of at most `max_chars`, in `overlap_chars`
/// sliding windows measured over the *raw* text; address preprocessing is
/// applied to each emitted part after the window boundaries are already
/// chosen (mirrors the Python implementation precisely: advancing the
/// window uses the unprocessed length, only the final emitted string gets
/// the `[CONTRACT_ADDRESSES]` trailer).
fn split_by_length(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![preprocess_for_search(text)];
    }

    let mut parts = Vec::new();
    let mut start = 0usize;
    let step = max_chars.saturating_sub(overlap_chars).max(1);

    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        let raw: String = chars[start..end].iter().collect();
        parts.push(preprocess_for_search(&raw));
        if end == chars.len() {
            break;
        }
        start += step;
    }
    parts
}

/// Header-aware Markdown chunking: tracks an H1/H2/H3 breadcrumb
/// (`section_path`) as it scans line by line, replacing the relevant
/// breadcrumb segment whenever a header of that level is encountered, and
/// truncating deeper segments. Each resulting section is then length-split
/// with overlap.
pub fn chunk_markdown_by_headers(markdown: &str, max_chars: usize, overlap_chars: usize) -> Vec<ChunkItem> {
    let mut current_path: Vec<String> = Vec::new();
    let mut sections: Vec<(String, String)> = Vec::new(); // (section_path, body)
    let mut buffer = String::new();

    let flush = |path: &[String], buffer: &mut String, sections: &mut Vec<(String, String)>| {
        let trimmed = buffer.trim();
        if !trimmed.is_empty() {
            sections.push((path.join(" > "), trimmed.to_string()));
        }
        buffer.clear();
    };

    for line in markdown.lines() {
        if let Some(caps) = HEADER_RE.captures(line) {
            flush(&current_path, &mut buffer, &mut sections);
            let level = caps[1].len();
            let title = caps[2].trim().to_string();
            current_path.truncate(level - 1);
            current_path.push(title);
        } else {
            buffer.push_str(line);
            buffer.push('\n');
        }
    }
    flush(&current_path, &mut buffer, &mut sections);

    let mut chunks = Vec::new();
    for (section_path, body) in sections {
        for part in split_by_length(&body, max_chars, overlap_chars) {
            chunks.push(ChunkItem { section_path: section_path.clone(), text: part });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_for_search_appends_sorted_addresses() {
        let text = "See 0xBBBB000000000000000000000000000000000b and 0xAAAA000000000000000000000000000000000a.";
        let out = preprocess_for_search(text);
        let trailer = out.split("[CONTRACT_ADDRESSES]\n").nth(1).unwrap();
        let lines: Vec<&str> = trailer.lines().collect();
        assert_eq!(
            lines,
            vec![
                "0xaaaa000000000000000000000000000000000a",
                "0xbbbb000000000000000000000000000000000b",
            ]
        );
    }

    #[test]
    fn preprocess_for_search_is_noop_without_addresses() {
        let text = "nothing to see here";
        assert_eq!(preprocess_for_search(text), text);
    }

    #[test]
    fn chunk_markdown_by_headers_tracks_breadcrumb() {
        let md = "# Title\nintro text\n## Sub\nsub text\n### Deep\ndeep text\n## Sub2\nmore text\n";
        let chunks = chunk_markdown_by_headers(md, 2400, 200);
        let paths: Vec<&str> = chunks.iter().map(|c| c.section_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["Title", "Title > Sub", "Title > Sub > Deep", "Title > Sub2"]
        );
    }

    #[test]
    fn chunk_markdown_by_headers_replaces_sibling_header_segment() {
        let md = "# A\n## B\ntext\n## C\nother\n";
        let chunks = chunk_markdown_by_headers(md, 2400, 200);
        let paths: Vec<&str> = chunks.iter().map(|c| c.section_path.as_str()).collect();
        assert_eq!(paths, vec!["A > B", "A > C"]);
    }

    #[test]
    fn split_by_length_respects_max_chars_with_overlap() {
        let long = "a".repeat(5000);
        let parts = split_by_length(&long, 2400, 200);
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(part.chars().count() <= 2400);
        }
    }
}
