//! Reranker adapter (spec §4.5). A cross-encoder-style reranker that scores
//! `(query, candidate)` pairs and reorders the candidate list; callers
//! treat any failure as non-fatal and fall back to the pre-rerank ordering,
//! mirroring `original_source/onekey_rag_service/rag/reranker.py::BGEReranker`.

use crate::config::{RerankConfig, RerankProvider};
use crate::error::{AppError, AppResult};
use crate::store::types::RetrievedChunk;
use async_trait::async_trait;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Reorders (a prefix of) `candidates` by relevance to `query`,
    /// returning at most `top_n` results. Candidates beyond
    /// `max_candidates` are dropped before scoring, matching the BGE
    /// reranker's truncation behavior.
    async fn rerank(&self, query: &str, candidates: Vec<RetrievedChunk>, top_n: usize) -> AppResult<Vec<RetrievedChunk>>;
}

/// Calls a cross-encoder-style HTTP reranking endpoint (e.g. a local
/// `text-embeddings-inference`/BGE reranker server). Truncates both the
/// candidate pool and each candidate's text before scoring.
pub struct HttpCrossEncoderReranker {
    client: reqwest::Client,
    base_url: String,
    max_candidates: usize,
    max_chars: usize,
}

impl HttpCrossEncoderReranker {
    pub fn new(base_url: String, max_candidates: usize) -> Self {
        HttpCrossEncoderReranker {
            client: reqwest::Client::new(),
            base_url,
            max_candidates,
            max_chars: 1200,
        }
    }

    fn clamp(&self, text: &str) -> String {
        if text.chars().count() <= self.max_chars {
            text.to_string()
        } else {
            text.chars().take(self.max_chars).collect()
        }
    }
}

#[async_trait]
impl Reranker for HttpCrossEncoderReranker {
    async fn rerank(&self, query: &str, mut candidates: Vec<RetrievedChunk>, top_n: usize) -> AppResult<Vec<RetrievedChunk>> {
        candidates.truncate(self.max_candidates);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let texts: Vec<String> = candidates.iter().map(|c| self.clamp(&c.text)).collect();
        let resp = self
            .client
            .post(format!("{}/rerank", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "query": query, "texts": texts }))
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("reranker request: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::DependencyLogic(format!("reranker response parse: {e}")))?;
        let scores = body
            .get("scores")
            .and_then(|s| s.as_array())
            .ok_or_else(|| AppError::DependencyLogic("reranker response missing scores[]".into()))?;

        if scores.len() != candidates.len() {
            return Err(AppError::DependencyLogic("reranker returned mismatched score count".into()));
        }

        for (candidate, score) in candidates.iter_mut().zip(scores.iter()) {
            candidate.score = score.as_f64().unwrap_or(candidate.score);
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_n);
        Ok(candidates)
    }
}

/// Builds the configured reranker, or `None` when reranking is disabled
/// (`RERANK_PROVIDER=none`), mirroring `reranker.py::build_reranker`.
pub fn build_reranker(config: &RerankConfig, base_url: Option<String>) -> Option<Box<dyn Reranker>> {
    match config.provider {
        RerankProvider::None => None,
        RerankProvider::CrossEncoder => {
            let base_url = base_url.unwrap_or_else(|| "http://localhost:8081".to_string());
            Some(Box::new(HttpCrossEncoderReranker::new(base_url, config.max_candidates)))
        }
    }
}

/// Reranks with `reranker`, falling back to the original (already
/// retrieval-ranked) order truncated to `top_n` on any failure — reranking
/// must never turn a working answer into a failed request.
pub async fn rerank_or_fallback(
    reranker: Option<&dyn Reranker>,
    query: &str,
    candidates: Vec<RetrievedChunk>,
    top_n: usize,
) -> Vec<RetrievedChunk> {
    let Some(reranker) = reranker else {
        let mut fallback = candidates;
        fallback.truncate(top_n);
        return fallback;
    };

    let fallback_len = top_n;
    let mut pre_rerank = candidates.clone();
    match reranker.rerank(query, candidates, top_n).await {
        Ok(reranked) => reranked,
        Err(e) => {
            tracing::warn!(error = %e, "reranker failed, falling back to pre-rerank order");
            pre_rerank.truncate(fallback_len);
            pre_rerank
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::RetrievedChunk;
    use uuid::Uuid;

    fn chunk(score: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            kb_id: Uuid::new_v4(),
            url: "https://example.com".into(),
            title: "Doc".into(),
            section_path: "Intro".into(),
            text: "text".into(),
            score,
        }
    }

    #[tokio::test]
    async fn rerank_or_fallback_truncates_when_no_reranker_configured() {
        let candidates = vec![chunk(0.1), chunk(0.9), chunk(0.5)];
        let result = rerank_or_fallback(None, "query", candidates, 2).await;
        assert_eq!(result.len(), 2);
    }
}
