//! Prompt assembler (spec §4.9): turns selected chunks, conversation
//! compaction output, and the request's system instructions into the
//! `[system, user]` message pair sent to the chat provider. Grounded in
//! `original_source/.../rag/pipeline.py` (`_build_context`, `default_user`,
//! `_resolve_default_prompts`).

use crate::chat::ChatMessage;
use crate::store::types::RetrievedChunk;
use regex::Regex;

/// Source item returned to the caller alongside the answer.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SourceItem {
    pub ref_num: Option<usize>,
    pub url: String,
    pub title: String,
    pub section_path: String,
    pub snippet: String,
}

fn slugify_anchor(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let stripped: String = lower.chars().map(|c| if c.is_alphanumeric() || c.is_whitespace() || c == '-' { c } else { ' ' }).collect();
    let dashed = Regex::new(r"\s+").unwrap().replace_all(stripped.trim(), "-").to_string();
    Regex::new(r"-{2,}").unwrap().replace_all(&dashed, "-").trim_matches('-').to_string()
}

fn append_anchor(url: &str, section_path: &str) -> String {
    if url.is_empty() || url.contains('#') {
        return url.to_string();
    }
    let last = section_path.split(" > ").last().unwrap_or("").trim();
    let anchor = slugify_anchor(last);
    if anchor.is_empty() {
        url.to_string()
    } else {
        format!("{url}#{anchor}")
    }
}

fn clamp_text(text: &str, max_len: usize) -> String {
    let count = text.chars().count();
    if count <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}\u{2026}")
    }
}

/// Builds numbered inline-citation sources `[1..N]` aligned with the
/// context block's `[i]` markers.
pub fn build_inline_sources(chunks: &[RetrievedChunk], snippet_max_chars: usize, max_sources: usize) -> Vec<SourceItem> {
    chunks
        .iter()
        .take(max_sources)
        .enumerate()
        .map(|(i, c)| SourceItem {
            ref_num: Some(i + 1),
            url: append_anchor(&c.url, &c.section_path),
            title: c.title.clone(),
            section_path: c.section_path.clone(),
            snippet: clamp_text(&c.text.replace('\n', " ").trim(), snippet_max_chars),
        })
        .collect()
}

/// Builds de-duplicated-by-URL sources without inline reference numbers,
/// for the non-inline-citation mode.
pub fn build_sources(chunks: &[RetrievedChunk], max_sources: usize) -> Vec<SourceItem> {
    let mut sorted: Vec<&RetrievedChunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for c in sorted {
        let url = append_anchor(&c.url, &c.section_path);
        if !seen.insert(url.clone()) {
            continue;
        }
        out.push(SourceItem { ref_num: None, url, title: c.title.clone(), section_path: c.section_path.clone(), snippet: String::new() });
        if out.len() >= max_sources {
            break;
        }
    }
    out
}

pub fn fill_source_snippets(sources: &mut [SourceItem], chunks: &[RetrievedChunk], snippet_max_chars: usize) {
    let mut by_url: std::collections::HashMap<&str, &RetrievedChunk> = std::collections::HashMap::new();
    let mut sorted: Vec<&RetrievedChunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for c in sorted {
        by_url.entry(&c.url).or_insert(c);
    }
    for s in sources.iter_mut() {
        if let Some(c) = by_url.get(s.url.as_str()) {
            s.snippet = clamp_text(c.text.replace('\n', " ").trim(), snippet_max_chars);
        }
    }
}

/// Renders the `[i]\nURL: ...\nTitle: ...\nSection: ...\nContent:\n...\n`
/// context block, stopping before exceeding `max_chars`.
pub fn build_context(chunks: &[RetrievedChunk], max_chars: usize) -> String {
    let mut parts = Vec::new();
    let mut total = 0usize;
    for (i, c) in chunks.iter().enumerate() {
        let block = format!("[{}]\nURL: {}\nTitle: {}\nSection: {}\nContent:\n{}\n", i + 1, c.url, c.title, c.section_path, c.text);
        if total + block.len() > max_chars {
            break;
        }
        total += block.len();
        parts.push(block);
    }
    parts.join("\n\n").trim().to_string()
}

/// Picks the default system instruction and "no sources" fallback answer
/// for a requested model family.
pub fn resolve_default_prompts(requested_model: Option<&str>) -> (&'static str, &'static str) {
    match requested_model {
        Some("onekey-docs") | None => (
            "You are the OneKey developer-docs assistant. You must answer strictly from the provided document snippets; never invent facts.",
            "我在 OneKey 开发者文档中没有检索到直接相关的内容。你可以换一种问法，或提供更具体的关键词（如 SDK 名称/方法名/报错信息）。",
        ),
        Some(_) => (
            "You are a knowledge-base assistant. You must answer strictly from the provided snippets; never invent facts.",
            "No relevant content was found in this knowledge base. Try supplying more docs or rephrasing the question.",
        ),
    }
}

/// Everything the prompt assembler needs beyond the selected chunks.
pub struct PromptInputs<'a> {
    pub system_instructions: &'a str,
    pub memory_summary: Option<&'a str>,
    pub history_excerpt: &'a str,
    pub question: &'a str,
    pub requested_model: Option<&'a str>,
    pub inline_citations_enabled: bool,
    pub context_max_chars: usize,
}

/// Assembles the final `[system, user]` message pair from ranked chunks and
/// conversation context (spec §4.9).
pub fn assemble_prompt(chunks: &[RetrievedChunk], inputs: &PromptInputs) -> Vec<ChatMessage> {
    let (default_system, _) = resolve_default_prompts(inputs.requested_model);
    let context = build_context(chunks, inputs.context_max_chars);

    let mut extra = String::new();
    if !inputs.system_instructions.is_empty() {
        extra.push_str(&format!("Additional caller instructions (rules take precedence on conflict):\n{}\n\n", inputs.system_instructions));
    }
    if let Some(summary) = inputs.memory_summary {
        if !summary.is_empty() {
            extra.push_str(&format!("Conversation summary (compressed memory):\n{summary}\n\n"));
        }
    }
    if !inputs.history_excerpt.is_empty() {
        extra.push_str(&format!("Recent conversation excerpt:\n{}\n\n", inputs.history_excerpt));
    }

    let formatting_rules = "Formatting rules (important):\n\
        - Respond in Markdown.\n\
        - Wrap short identifiers (variable/method/field names, commands, error keywords) in inline code, e.g. `connectId`, `HardwareSDK.init()`.\n\
        - Use fenced code blocks for multi-line code/commands/config, with a language tag when possible.\n\n";

    let citation_rules = if inputs.inline_citations_enabled {
        format!(
            "Citation rules (important):\n\
            - Only cite reference numbers 1..{} using the format [n].\n\
            - Every key claim/step must end with at least one citation; say so explicitly if the snippets don't support a claim.\n\
            - Don't list raw URLs in the body; use [n] citations only.\n\n",
            chunks.len()
        )
    } else {
        String::new()
    };

    let user = format!(
        "{extra}Question: {}\n\nDocument snippets (citable):\n{context}\n\n{formatting_rules}{citation_rules}\
        Please answer with:\n1) a brief conclusion (1-3 sentences)\n2) concrete steps (bulleted)\n\
        3) example code/config if the snippets include any\n4) caveats/common pitfalls, if any\n",
        inputs.question
    );

    vec![
        ChatMessage { role: "system".into(), content: default_system.to_string() },
        ChatMessage { role: "user".into(), content: user },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(url: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk { chunk_id: Uuid::new_v4(), kb_id: Uuid::new_v4(), url: url.into(), title: "Doc".into(), section_path: "Intro > Setup".into(), text: "body text".into(), score }
    }

    #[test]
    fn build_context_stops_before_exceeding_max_chars() {
        let chunks = vec![chunk("https://a", 1.0), chunk("https://b", 0.9)];
        let ctx = build_context(&chunks, 40);
        assert!(ctx.len() <= 60);
        assert!(ctx.contains("[1]"));
    }

    #[test]
    fn append_anchor_slugifies_last_section_segment() {
        let url = append_anchor("https://docs.example.com/page", "Intro > Quick Setup");
        assert_eq!(url, "https://docs.example.com/page#quick-setup");
    }

    #[test]
    fn build_inline_sources_numbers_sequentially() {
        let chunks = vec![chunk("https://a", 1.0), chunk("https://b", 0.9)];
        let sources = build_inline_sources(&chunks, 100, 5);
        assert_eq!(sources[0].ref_num, Some(1));
        assert_eq!(sources[1].ref_num, Some(2));
    }
}
