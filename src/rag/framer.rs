//! Answer framer (spec §4.10): post-processes raw chat-provider output into
//! the final response text — JSON-mode enforcement, inline-citation
//! sanitization, and a trailing sources list. Grounded in
//! `original_source/.../rag/pipeline.py` (`_ensure_json_object`,
//! `_sanitize_inline_citations`, `_build_references_tail`).

use crate::rag::prompt::SourceItem;
use once_cell::sync::Lazy;
use regex::Regex;

fn clamp_text(text: &str, max_len: usize) -> String {
    let count = text.chars().count();
    if count <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}\u{2026}")
    }
}

fn strip_code_fences(text: &str) -> String {
    let t = text.trim();
    if let Some(rest) = t.strip_prefix("```") {
        let rest = rest.splitn(2, '\n').nth(1).unwrap_or("");
        return rest.strip_suffix("```").unwrap_or(rest).trim().to_string();
    }
    t.to_string()
}

fn extract_json_object(text: &str) -> String {
    let t = strip_code_fences(text);
    if t.is_empty() {
        return String::new();
    }
    match (t.find('{'), t.rfind('}')) {
        (Some(start), Some(end)) if end > start => t[start..=end].to_string(),
        _ => t,
    }
}

/// Ensures the model's output is a JSON object string, falling back to an
/// `{"error":"invalid_json", ...}` envelope on any parse failure.
pub fn ensure_json_object(content: &str) -> String {
    let raw = extract_json_object(content);
    if !raw.is_empty() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
            if value.is_object() {
                return serde_json::to_string(&value).unwrap_or_default();
            }
            return serde_json::json!({ "data": value }).to_string();
        }
    }
    serde_json::json!({
        "error": "invalid_json",
        "message": clamp_text(content.trim(), 2000),
    })
    .to_string()
}

static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d{1,3})\]").unwrap());
static MULTISPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").unwrap());

/// Strips citation tokens `[n]` whose `n` falls outside `1..=max_ref`.
pub fn sanitize_inline_citations(text: &str, max_ref: usize) -> String {
    let replaced = CITATION_RE.replace_all(text, |caps: &regex::Captures| {
        let n: usize = caps[1].parse().unwrap_or(0);
        if n >= 1 && n <= max_ref {
            caps[0].to_string()
        } else {
            String::new()
        }
    });
    MULTISPACE_RE.replace_all(replaced.trim(), " ").to_string()
}

pub fn has_any_inline_citation(text: &str) -> bool {
    CITATION_RE.is_match(text)
}

/// Builds the trailing references block — a numbered "参考：" list in
/// inline-citation mode, or an unordered "来源：" list otherwise.
pub fn build_references_tail(sources: &[SourceItem], inline: bool) -> String {
    if sources.is_empty() {
        return String::new();
    }
    if inline {
        let mut lines = vec!["\n\n参考：".to_string()];
        for (i, s) in sources.iter().enumerate() {
            let ref_num = s.ref_num.unwrap_or(i + 1);
            if !s.title.is_empty() {
                lines.push(format!("[{ref_num}] {} - {}", s.title, s.url));
            } else {
                lines.push(format!("[{ref_num}] {}", s.url));
            }
        }
        return lines.join("\n").trim_end().to_string();
    }
    let mut lines = vec!["\n\n来源：".to_string()];
    for s in sources.iter().filter(|s| !s.url.is_empty()) {
        lines.push(format!("- {}", s.url));
    }
    lines.join("\n").trim_end().to_string()
}

/// Frames raw chat content into the final answer text per spec §4.10.
pub fn frame_answer(content: &str, json_mode: bool, inline_citations_enabled: bool, append_sources: bool, sources: &[SourceItem]) -> String {
    if json_mode {
        return ensure_json_object(content);
    }

    let mut text = content.trim().to_string();
    if inline_citations_enabled {
        text = sanitize_inline_citations(&text, sources.len());
        if !sources.is_empty() && !has_any_inline_citation(&text) {
            text = format!("{text}\n\n(No inline citation markers were generated; sources are listed below.)").trim().to_string();
        }
    }
    if append_sources && !sources.is_empty() {
        text.push_str(&build_references_tail(sources, inline_citations_enabled));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_json_object_wraps_invalid_json() {
        let result = ensure_json_object("not json at all");
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["error"], "invalid_json");
    }

    #[test]
    fn ensure_json_object_passes_through_valid_object() {
        let result = ensure_json_object("```json\n{\"a\": 1}\n```");
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn sanitize_inline_citations_drops_out_of_range_refs() {
        let cleaned = sanitize_inline_citations("see [1] and [99]", 2);
        assert!(cleaned.contains("[1]"));
        assert!(!cleaned.contains("[99]"));
    }

    #[test]
    fn build_references_tail_numbers_by_ref_field() {
        let sources = vec![SourceItem { ref_num: Some(1), url: "https://a".into(), title: "A".into(), section_path: String::new(), snippet: String::new() }];
        let tail = build_references_tail(&sources, true);
        assert!(tail.contains("[1] A - https://a"));
    }
}
