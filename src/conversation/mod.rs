//! Conversation compaction (spec §4.8): one LLM call that both rewrites a
//! multi-turn conversation into a retrieval-ready query and compresses the
//! preceding turns into a short memory summary. Grounded in
//! `original_source/.../rag/conversation.py`.

use crate::chat::{ChatCompletionRequest, ChatMessage, ChatProvider};
use crate::config::CompactionConfig;

fn clamp_text(text: &str, max_len: usize) -> String {
    let count = text.chars().count();
    if count <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}\u{2026}")
    }
}

#[derive(Clone, Debug)]
pub struct CompactionResult {
    pub retrieval_query: String,
    pub memory_summary: Option<String>,
    pub used_llm: bool,
}

/// Joins every `system` message's content, used to preserve user-supplied
/// system instructions across compaction.
pub fn extract_system_instructions(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders the last `max_messages` user/assistant turns (excluding the
/// current question) as a compact transcript for compaction/prompt context.
pub fn format_history_excerpt(messages: &[ChatMessage], max_messages: usize, max_chars: usize, per_message_max_chars: usize) -> String {
    let filtered: Vec<&ChatMessage> = messages.iter().filter(|m| m.role == "user" || m.role == "assistant").collect();
    let windowed: Vec<&ChatMessage> = if max_messages > 0 && filtered.len() > max_messages {
        filtered[filtered.len() - max_messages..].to_vec()
    } else {
        filtered
    };

    let lines: Vec<String> = windowed
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| {
            let who = if m.role == "user" { "User" } else { "Assistant" };
            format!("{who}: {}", clamp_text(m.content.trim(), per_message_max_chars))
        })
        .collect();

    clamp_text(lines.join("\n").trim(), max_chars)
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

/// Removes a leading/trailing quote character from a model-produced string
/// field, without otherwise altering content.
fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"').trim_matches('\'')
}

/// Runs conversation compaction via one LLM call, returning the original
/// question unchanged (`used_llm: false`) when compaction is disabled,
/// the conversation has fewer than two user turns, or the call fails —
/// compaction is an enhancement, never a hard dependency of the main path.
pub async fn compact_conversation(
    config: &CompactionConfig,
    chat: &dyn ChatProvider,
    model: &str,
    messages: &[ChatMessage],
    question: &str,
) -> CompactionResult {
    if !config.query_rewrite_enabled && !config.memory_summary_enabled {
        return CompactionResult { retrieval_query: question.to_string(), memory_summary: None, used_llm: false };
    }

    let user_turns = messages.iter().filter(|m| m.role == "user").count();
    if user_turns < 2 {
        return CompactionResult { retrieval_query: question.to_string(), memory_summary: None, used_llm: false };
    }

    let mut history_messages = messages.to_vec();
    if let Some(pos) = history_messages.iter().rposition(|m| m.role == "user") {
        history_messages.remove(pos);
    }

    let history = format_history_excerpt(&history_messages, config.max_history_messages, config.max_history_chars, config.per_message_max_chars);

    let system = "You are a conversation preprocessor. Output strict JSON only, no markdown fences, with keys:\n\
        {\"query\": \"a standalone question suitable for retrieving developer docs, keeping proper nouns/error codes/method names/code symbols\", \
        \"summary\": \"a compressed memory of the conversation (<=8 bullet points covering goals/context/constraints/attempts/key entities; empty string if none)\"}\n\
        Do not include URLs or unrelated content.";
    let user = format!("Current question: {question}\n\nRecent conversation:\n{history}\n");

    let request = ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.to_string() },
            ChatMessage { role: "user".into(), content: user },
        ],
        temperature: Some(0.0),
        top_p: Some(1.0),
        max_tokens: Some(config.max_tokens),
        json_mode: false,
    };

    let result = match chat.complete(request).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "conversation compaction call failed, falling back to raw question");
            return CompactionResult { retrieval_query: question.to_string(), memory_summary: None, used_llm: false };
        }
    };

    let json_text = extract_json_object(&result.content);
    let parsed: serde_json::Value = match serde_json::from_str(&json_text) {
        Ok(v) => v,
        Err(_) => return CompactionResult { retrieval_query: question.to_string(), memory_summary: None, used_llm: true },
    };

    let retrieval_query = parsed
        .get("query")
        .and_then(|v| v.as_str())
        .map(unquote)
        .filter(|s| !s.is_empty())
        .map(|s| clamp_text(s, 220))
        .unwrap_or_else(|| question.to_string());

    let memory_summary = parsed
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| clamp_text(s, 1400));

    CompactionResult { retrieval_query, memory_summary, used_llm: true }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_history_excerpt_drops_system_and_tool_messages() {
        let messages = vec![
            ChatMessage { role: "system".into(), content: "rules".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
            ChatMessage { role: "assistant".into(), content: "hello".into() },
        ];
        let excerpt = format_history_excerpt(&messages, 10, 1000, 800);
        assert!(excerpt.contains("User: hi"));
        assert!(excerpt.contains("Assistant: hello"));
        assert!(!excerpt.contains("rules"));
    }

    #[test]
    fn extract_json_object_strips_code_fences() {
        let raw = "```json\n{\"query\": \"x\", \"summary\": \"\"}\n```";
        let extracted = extract_json_object(raw);
        assert_eq!(extracted, "{\"query\": \"x\", \"summary\": \"\"}");
    }

    #[test]
    fn clamp_text_truncates_with_ellipsis() {
        let clamped = clamp_text("hello world", 5);
        assert_eq!(clamped, "hell\u{2026}");
    }
}
