//! Upstream chat completion provider (spec §4.9-§4.11). A small trait over
//! an OpenAI-compatible `/chat/completions` endpoint, supporting both the
//! buffered call used for compaction/answering and an SSE delta stream.
//! Grounded in the teacher's HTTP adapter pattern and
//! `original_source/.../rag/pipeline.py`'s `ChatProvider.complete()` call sites.

use crate::config::ChatConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ChatCompletionResult {
    pub content: String,
    pub usage: ChatUsage,
}

#[derive(Clone, Debug, Default)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

/// One incremental delta from a streamed chat completion.
#[derive(Clone, Debug)]
pub enum ChatDelta {
    Content(String),
    Done(ChatUsage),
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: ChatCompletionRequest) -> AppResult<ChatCompletionResult>;

    async fn stream(&self, request: ChatCompletionRequest) -> AppResult<BoxStream<'static, AppResult<ChatDelta>>>;
}

/// Calls an OpenAI-compatible `/chat/completions` endpoint, such as Ollama's
/// OpenAI shim or a hosted vLLM/OpenAI-compatible gateway.
pub struct OpenAiCompatibleChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleChat {
    pub fn new(config: &ChatConfig) -> Self {
        OpenAiCompatibleChat {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn build_body(&self, request: &ChatCompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(t) = request.temperature {
            obj.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(m) = request.max_tokens {
            obj.insert("max_tokens".into(), serde_json::json!(m));
        }
        if request.json_mode {
            obj.insert("response_format".into(), serde_json::json!({ "type": "json_object" }));
        }
        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleChat {
    async fn complete(&self, request: ChatCompletionRequest) -> AppResult<ChatCompletionResult> {
        let body = self.build_body(&request, false);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("chat request: {e}")))?;
        let status = resp.status();
        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::DependencyLogic(format!("chat response parse: {e}")))?;
        if !status.is_success() {
            return Err(AppError::DependencyLogic(format!("chat endpoint returned {status}: {parsed}")));
        }

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let usage = parsed
            .get("usage")
            .and_then(|u| serde_json::from_value::<ChatUsage>(u.clone()).ok())
            .unwrap_or_default();
        Ok(ChatCompletionResult { content, usage })
    }

    async fn stream(&self, request: ChatCompletionRequest) -> AppResult<BoxStream<'static, AppResult<ChatDelta>>> {
        use futures_util::StreamExt;

        let body = self.build_body(&request, true);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("chat stream request: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::DependencyLogic(format!("chat stream endpoint returned {}", resp.status())));
        }

        let byte_stream = resp.bytes_stream();
        let mapped = byte_stream
            .map(|chunk| chunk.map_err(|e| AppError::DependencyUnavailable(format!("chat stream read: {e}"))))
            .flat_map(|chunk| {
                let lines: Vec<AppResult<ChatDelta>> = match chunk {
                    Ok(bytes) => parse_sse_chunk(&bytes),
                    Err(e) => vec![Err(e)],
                };
                futures::stream::iter(lines)
            });
        Ok(Box::pin(mapped))
    }
}

/// Parses one or more `data: {...}` SSE lines out of a raw byte chunk from
/// an OpenAI-compatible streaming response, yielding content deltas and a
/// terminal `Done` on `[DONE]`.
fn parse_sse_chunk(bytes: &[u8]) -> Vec<AppResult<ChatDelta>> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else { continue };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            out.push(Ok(ChatDelta::Done(ChatUsage::default())));
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(data) {
            Ok(value) => {
                if let Some(content) = value.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
                    if !content.is_empty() {
                        out.push(Ok(ChatDelta::Content(content.to_string())));
                    }
                }
                if let Some(usage) = value.get("usage").and_then(|u| serde_json::from_value::<ChatUsage>(u.clone()).ok()) {
                    out.push(Ok(ChatDelta::Done(usage)));
                }
            }
            Err(e) => out.push(Err(AppError::DependencyLogic(format!("chat stream chunk parse: {e}")))),
        }
    }
    out
}

pub fn build_chat_provider(config: &ChatConfig) -> Box<dyn ChatProvider> {
    Box::new(OpenAiCompatibleChat::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sse_chunk_extracts_content_and_done() {
        let raw = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        let deltas = parse_sse_chunk(raw);
        assert_eq!(deltas.len(), 2);
        match deltas[0].as_ref().unwrap() {
            ChatDelta::Content(c) => assert_eq!(c, "hi"),
            _ => panic!("expected content delta"),
        }
        assert!(matches!(deltas[1].as_ref().unwrap(), ChatDelta::Done(_)));
    }

    #[test]
    fn parse_sse_chunk_ignores_blank_and_non_data_lines() {
        let raw = b": comment\n\ndata: {\"choices\":[{\"delta\":{}}]}\n\n";
        let deltas = parse_sse_chunk(raw);
        assert!(deltas.is_empty());
    }
}
