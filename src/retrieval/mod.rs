//! Retrieval engine (spec §4.4): vector-only or hybrid (vector + BM25/FTS)
//! search, run per knowledge-base against its allocated `top_k`, then
//! max-score-per-chunk merged across knowledge bases and across query
//! variants. Grounded in call-site usage in
//! `original_source/onekey_rag_service/rag/pipeline.py` (`_merge_candidates`)
//! since `pgvector_store.py`/`kb_allocation.py` themselves were not present
//! in the retrieved source pack.

use crate::config::{RetrievalConfig, RetrievalMode};
use crate::embedding::EmbeddingBackend;
use crate::error::AppResult;
use crate::store::types::{KbAllocation, RetrievedChunk};
use crate::store::Store;
use std::collections::HashMap;

/// Runs retrieval for a single knowledge base at the configured mode.
async fn retrieve_for_kb(
    store: &dyn Store,
    embeddings: &dyn EmbeddingBackend,
    config: &RetrievalConfig,
    allocation: KbAllocation,
    query: &str,
) -> AppResult<Vec<RetrievedChunk>> {
    if allocation.top_k == 0 {
        return Ok(Vec::new());
    }

    match config.mode {
        RetrievalMode::Vector => {
            let query_embedding = embeddings.embed_query(query).await?;
            store.vector_search(allocation.kb_id, &query_embedding, allocation.top_k).await
        }
        RetrievalMode::Hybrid => {
            let query_embedding = embeddings.embed_query(query).await?;
            let mut vector_hits = store
                .vector_search(allocation.kb_id, &query_embedding, config.hybrid_vector_k)
                .await?;
            let mut bm25_hits = store.fts_search(allocation.kb_id, query, config.hybrid_bm25_k).await?;

            // score = vector_weight·norm(vec_score) + bm25_weight·norm(lex_score), each
            // norm a min-max over its own candidate set; a side a chunk is missing from
            // contributes 0 (spec §4.4).
            normalize_scores(&mut vector_hits);
            normalize_scores(&mut bm25_hits);

            let mut combined: HashMap<uuid::Uuid, RetrievedChunk> = HashMap::new();
            for mut hit in vector_hits {
                hit.score *= config.hybrid_vector_weight;
                combined.insert(hit.chunk_id, hit);
            }
            for mut hit in bm25_hits {
                hit.score *= config.hybrid_bm25_weight;
                combined
                    .entry(hit.chunk_id)
                    .and_modify(|existing| existing.score += hit.score)
                    .or_insert(hit);
            }

            let mut results: Vec<RetrievedChunk> = combined.into_values().collect();
            sort_by_score_then_chunk_id(&mut results);
            results.truncate(allocation.top_k);
            Ok(results)
        }
    }
}

/// Min-max normalizes `hits` in place over their own score range. A set with
/// a single item (zero range) normalizes to 1.0 rather than dividing by zero.
fn normalize_scores(hits: &mut [RetrievedChunk]) {
    if hits.is_empty() {
        return;
    }
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|h| h.score).fold(f64::NEG_INFINITY, f64::max);
    for hit in hits.iter_mut() {
        hit.score = if max > min { (hit.score - min) / (max - min) } else { 1.0 };
    }
}

/// Higher score first; ties broken by higher `chunk_id` (spec §4.4).
fn sort_by_score_then_chunk_id(results: &mut [RetrievedChunk]) {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| b.chunk_id.cmp(&a.chunk_id)));
}

/// Merges candidate sets keeping, for each `chunk_id`, the maximum score
/// observed across all sources, then sorts descending and truncates.
pub fn merge_candidates(sources: Vec<Vec<RetrievedChunk>>, top_n: usize) -> Vec<RetrievedChunk> {
    let mut best: HashMap<uuid::Uuid, RetrievedChunk> = HashMap::new();
    for batch in sources {
        for chunk in batch {
            best.entry(chunk.chunk_id)
                .and_modify(|existing| {
                    if chunk.score > existing.score {
                        *existing = chunk.clone();
                    }
                })
                .or_insert(chunk);
        }
    }
    let mut merged: Vec<RetrievedChunk> = best.into_values().collect();
    sort_by_score_then_chunk_id(&mut merged);
    merged.truncate(top_n);
    merged
}

/// Retrieves across every allocated knowledge base for one query string and
/// merges the results. `strict_kb` with every allocation's `top_k == 0`
/// (spec §9 open-question resolution #2) returns an empty result rather
/// than erroring.
pub async fn retrieve(
    store: &dyn Store,
    embeddings: &dyn EmbeddingBackend,
    config: &RetrievalConfig,
    allocations: &[KbAllocation],
    query: &str,
    top_n: usize,
) -> AppResult<Vec<RetrievedChunk>> {
    if allocations.iter().all(|a| a.top_k == 0) {
        return Ok(Vec::new());
    }

    let mut per_kb = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        per_kb.push(retrieve_for_kb(store, embeddings, config, *allocation, query).await?);
    }
    Ok(merge_candidates(per_kb, top_n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(id: Uuid, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id,
            kb_id: Uuid::new_v4(),
            url: "https://example.com".into(),
            title: "Doc".into(),
            section_path: "Intro".into(),
            text: "text".into(),
            score,
        }
    }

    #[test]
    fn merge_candidates_keeps_max_score_per_chunk() {
        let id = Uuid::new_v4();
        let sources = vec![vec![chunk(id, 0.3)], vec![chunk(id, 0.9)]];
        let merged = merge_candidates(sources, 10);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].score, 0.9);
    }

    #[test]
    fn merge_candidates_truncates_to_top_n() {
        let sources = vec![(0..5).map(|i| chunk(Uuid::new_v4(), i as f64)).collect()];
        let merged = merge_candidates(sources, 2);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].score >= merged[1].score);
    }

    /// A query embedding fixed at `[1.0, 0.0]`, so cosine similarity against a
    /// unit vector `[x, y]` is exactly `x`.
    struct FixedQueryEmbedding;

    #[async_trait::async_trait]
    impl EmbeddingBackend for FixedQueryEmbedding {
        async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0_f32, 0.0_f32]).collect())
        }
    }

    /// Spec §8 scenario 4, worked by hand: candidate A is vector-only at
    /// cosine 0.9; candidate B is vector 0.7 / lexical 1.0. Weights 0.5/0.5.
    /// Min-max over the 2-item vector set gives norm(0.9)=1.0, norm(0.7)=0.0;
    /// the 1-item lexical set is degenerate and normalizes to 1.0. Both
    /// combine to exactly 0.5 and must tie-break on chunk_id.
    #[tokio::test]
    async fn hybrid_merge_normalizes_independently_and_ties_break_by_chunk_id() {
        use crate::config::{RetrievalConfig, RetrievalMode};
        use crate::store::memory::MemoryStore;
        use crate::store::types::{Chunk, KbAllocation};
        use chrono::Utc;

        let store = MemoryStore::new();
        let kb = store.get_or_create_kb("ws", "kb").await.unwrap();
        let page_id = Uuid::new_v4();

        let id_a = Uuid::from_u128(1);
        let id_b = Uuid::from_u128(2);

        let chunk_a = Chunk {
            id: id_a,
            page_id,
            kb_id: kb.id,
            chunk_index: 0,
            section_path: "Intro".into(),
            chunk_text: "vector only candidate, no lexical overlap here".into(),
            chunk_hash: "hash-a".into(),
            token_count: 7,
            embedding: Some(vec![0.9_f32, 0.19_f64.sqrt() as f32]),
            embedding_model: None,
            url: "https://example.com/a".into(),
            title: "Doc A".into(),
            created_at: Utc::now(),
        };
        let chunk_b = Chunk {
            id: id_b,
            page_id,
            kb_id: kb.id,
            chunk_index: 1,
            section_path: "Intro".into(),
            chunk_text: "contains the foo keyword exactly once".into(),
            chunk_hash: "hash-b".into(),
            token_count: 6,
            embedding: Some(vec![0.7_f32, 0.51_f64.sqrt() as f32]),
            embedding_model: None,
            url: "https://example.com/b".into(),
            title: "Doc B".into(),
            created_at: Utc::now(),
        };
        store.replace_chunks(page_id, vec![chunk_a, chunk_b]).await.unwrap();

        let config = RetrievalConfig {
            mode: RetrievalMode::Hybrid,
            top_k: 10,
            top_n: 10,
            hybrid_vector_k: 10,
            hybrid_bm25_k: 10,
            hybrid_vector_weight: 0.5,
            hybrid_bm25_weight: 0.5,
            bm25_fts_config: "simple".into(),
        };
        let allocation = KbAllocation { kb_id: kb.id, top_k: 10 };
        let embeddings = FixedQueryEmbedding;

        let results = retrieve_for_kb(&store, &embeddings, &config, allocation, "foo").await.unwrap();

        assert_eq!(results.len(), 2);
        assert!((results[0].score - 0.5).abs() < 1e-9);
        assert!((results[1].score - 0.5).abs() < 1e-9);
        // Tie on score: higher chunk_id sorts first.
        assert_eq!(results[0].chunk_id, id_b);
        assert_eq!(results[1].chunk_id, id_a);
    }
}
