//! Streaming protocol layer (spec §4.11): renders OpenAI-shaped SSE frames
//! around a chat-provider token stream, plus the non-standard
//! `chat.completion.sources` event. Grounded in the teacher's SSE framing
//! pattern (tower-http/axum `Sse` usage) and `schemas.py`'s response shapes.

use crate::chat::{ChatCompletionRequest, ChatDelta, ChatProvider};
use crate::rag::prompt::SourceItem;
use axum::response::sse::Event;
use futures::stream::{self, BoxStream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;

fn chunk_frame(id: &str, model: &str, created: i64, delta: serde_json::Value, finish_reason: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    })
}

fn sse_event(value: &serde_json::Value) -> Event {
    Event::default().data(value.to_string())
}

/// The `chat.completion.sources` event payload. Emitted unconditionally,
/// even with an empty `sources` list (spec §4.11 step 6 / §8 scenario 6).
fn sources_frame(sources: &[SourceItem]) -> serde_json::Value {
    let sources_json: Vec<serde_json::Value> = sources
        .iter()
        .map(|s| serde_json::json!({ "ref": s.ref_num, "url": s.url, "title": s.title, "section_path": s.section_path, "snippet": s.snippet }))
        .collect();
    serde_json::json!({ "object": "chat.completion.sources", "sources": sources_json })
}

/// Streams a prepared answer as OpenAI-compatible SSE frames:
/// role-open frame, content deltas, sources event, stop frame, `[DONE]`.
/// On a chat-provider error mid-stream, switches to an inline error-text
/// delta rather than changing the already-committed HTTP status.
pub fn stream_answer(
    chat: Arc<dyn ChatProvider>,
    request: ChatCompletionRequest,
    id: String,
    model: String,
    created: i64,
    sources: Vec<SourceItem>,
) -> BoxStream<'static, Result<Event, Infallible>> {
    let open = sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "role": "assistant" }), None));

    let tail = stream::once(async move {
        let mut frames = Vec::new();

        match chat.stream(request).await {
            Ok(mut deltas) => {
                while let Some(delta) = deltas.next().await {
                    match delta {
                        Ok(ChatDelta::Content(text)) => {
                            frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "content": text }), None)));
                        }
                        Ok(ChatDelta::Done(_)) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "chat stream failed mid-stream, emitting inline error text");
                            frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "content": format!("\n\n[error: {e}]") }), None)));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat stream request failed before first frame");
                frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "content": format!("[error: {e}]") }), None)));
            }
        }

        frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({}), Some("stop"))));
        frames.push(sse_event(&sources_frame(&sources)));
        frames.push(Event::default().data("[DONE]"));
        frames
    })
    .flat_map(|frames| stream::iter(frames.into_iter().map(Ok)));

    Box::pin(stream::once(async move { Ok(open) }).chain(tail))
}

/// Streams a fixed answer text (the "no sources" fallback, a timeout
/// message, or the no-chat-provider notice) as the same SSE frame sequence
/// `stream_answer` would produce, split into ~60-char content deltas the
/// way the original's `_chunk_text` does.
pub fn direct_answer_stream(
    id: String,
    model: String,
    created: i64,
    text: String,
    sources: Vec<SourceItem>,
) -> BoxStream<'static, Result<Event, Infallible>> {
    let open = sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "role": "assistant" }), None));

    let tail = stream::once(async move {
        let mut frames = Vec::new();
        const CHUNK_SIZE: usize = 60;
        let chars: Vec<char> = text.chars().collect();
        for part in chars.chunks(CHUNK_SIZE) {
            let part: String = part.iter().collect();
            frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({ "content": part }), None)));
        }

        frames.push(sse_event(&chunk_frame(&id, &model, created, serde_json::json!({}), Some("stop"))));
        frames.push(sse_event(&sources_frame(&sources)));
        frames.push(Event::default().data("[DONE]"));
        frames
    })
    .flat_map(|frames| stream::iter(frames.into_iter().map(Ok)));

    Box::pin(stream::once(async move { Ok(open) }).chain(tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_has_expected_shape() {
        let frame = chunk_frame("id-1", "onekey-docs", 0, serde_json::json!({"content": "hi"}), None);
        assert_eq!(frame["object"], "chat.completion.chunk");
        assert_eq!(frame["choices"][0]["delta"]["content"], "hi");
    }

    #[test]
    fn sources_frame_is_emitted_with_empty_array_when_there_are_no_sources() {
        let frame = sources_frame(&[]);
        assert_eq!(frame["object"], "chat.completion.sources");
        assert_eq!(frame["sources"], serde_json::json!([]));
    }

    #[test]
    fn sources_frame_carries_every_field() {
        let sources = vec![SourceItem {
            ref_num: Some(1),
            url: "https://docs.aave.com/pool".to_string(),
            title: "Aave Pool".to_string(),
            section_path: "Deployments".to_string(),
            snippet: "Aave V3 Pool deployment addresses".to_string(),
        }];
        let frame = sources_frame(&sources);
        assert_eq!(frame["sources"][0]["ref"], 1);
        assert_eq!(frame["sources"][0]["url"], "https://docs.aave.com/pool");
    }

    #[tokio::test]
    async fn direct_answer_stream_orders_stop_then_sources_then_done() {
        let stream = direct_answer_stream("chatcmpl-test".to_string(), "onekey-docs".to_string(), 0, "hi".to_string(), Vec::new());
        let events: Vec<Event> = stream.map(|r| r.unwrap()).collect().await;

        // role-open, 1 content delta, stop, sources (always, even empty), [DONE].
        assert_eq!(events.len(), 5);
        let rendered: Vec<String> = events.iter().map(|e| format!("{e:?}")).collect();
        assert!(rendered[2].contains("\"finish_reason\":\"stop\""));
        assert!(rendered[3].contains("chat.completion.sources"));
        assert!(rendered[3].contains("\"sources\":[]"));
        assert!(rendered[4].contains("[DONE]"));
    }
}
