//! In-memory `Store` reference implementation, backed by `DashMap` the way
//! the teacher engine keeps its memory tables — no persistence, suitable
//! for tests and for running without Postgres configured.

use super::types::*;
use super::Store;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub struct MemoryStore {
    workspaces: DashMap<String, Workspace>,
    kbs: DashMap<Uuid, KnowledgeBase>,
    kb_by_slug: DashMap<(Uuid, String), Uuid>,
    pages: DashMap<Uuid, Page>,
    pages_by_url: DashMap<String, Uuid>,
    chunks: DashMap<Uuid, Chunk>,
    chunks_by_page: DashMap<Uuid, Vec<Uuid>>,
    contracts: DashMap<String, ContractInfo>,
    jobs: DashMap<String, Job>,
    job_order: Mutex<Vec<String>>,
    file_batches: DashMap<Uuid, FileBatch>,
    feedback: DashMap<(String, String), Feedback>,
    job_seq: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            workspaces: DashMap::new(),
            kbs: DashMap::new(),
            kb_by_slug: DashMap::new(),
            pages: DashMap::new(),
            pages_by_url: DashMap::new(),
            chunks: DashMap::new(),
            chunks_by_page: DashMap::new(),
            contracts: DashMap::new(),
            jobs: DashMap::new(),
            job_order: Mutex::new(Vec::new()),
            file_batches: DashMap::new(),
            feedback: DashMap::new(),
            job_seq: AtomicI64::new(0),
        }
    }

    fn retrieved_from_chunk(chunk: &Chunk, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: chunk.id,
            kb_id: chunk.kb_id,
            url: chunk.url.clone(),
            title: chunk.title.clone(),
            section_path: chunk.section_path.clone(),
            text: chunk.chunk_text.clone(),
            score,
        }
    }
}

/// `1 - cosine_distance`, clamped to `[0,1]` (spec §4.4 vector-mode score).
fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    similarity.clamp(0.0, 1.0)
}

/// Rough term-frequency lexical score as a stand-in for a tsvector/GIN FTS
/// index when running without Postgres — not intended to replicate BM25
/// ranking precisely.
fn lexical_score(query: &str, text: &str) -> f64 {
    let query_terms: Vec<String> = query.to_lowercase().split_whitespace().map(|s| s.to_string()).collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let mut score = 0.0;
    for term in &query_terms {
        let count = lower.matches(term.as_str()).count();
        if count > 0 {
            score += 1.0 + (count as f64).ln();
        }
    }
    score / query_terms.len() as f64
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_or_create_kb(&self, workspace_name: &str, kb_slug: &str) -> AppResult<KnowledgeBase> {
        let workspace = self
            .workspaces
            .entry(workspace_name.to_string())
            .or_insert_with(|| Workspace {
                id: Uuid::new_v4(),
                name: workspace_name.to_string(),
                created_at: Utc::now(),
            })
            .clone();

        let key = (workspace.id, kb_slug.to_string());
        if let Some(kb_id) = self.kb_by_slug.get(&key) {
            return Ok(self.kbs.get(&kb_id).map(|k| k.clone()).unwrap());
        }

        let kb = KnowledgeBase {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            slug: kb_slug.to_string(),
            name: kb_slug.to_string(),
            created_at: Utc::now(),
        };
        self.kb_by_slug.insert(key, kb.id);
        self.kbs.insert(kb.id, kb.clone());
        Ok(kb)
    }

    async fn get_kb(&self, kb_id: Uuid) -> AppResult<Option<KnowledgeBase>> {
        Ok(self.kbs.get(&kb_id).map(|k| k.clone()))
    }

    async fn upsert_page(&self, mut page: Page) -> AppResult<Page> {
        if let Some(existing_id) = self.pages_by_url.get(&page.url) {
            page.id = *existing_id;
        } else {
            self.pages_by_url.insert(page.url.clone(), page.id);
        }
        self.pages.insert(page.id, page.clone());
        Ok(page)
    }

    async fn get_page_by_url(&self, url: &str) -> AppResult<Option<Page>> {
        Ok(self
            .pages_by_url
            .get(url)
            .and_then(|id| self.pages.get(&id).map(|p| p.clone())))
    }

    async fn pages_needing_reindex(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Page>> {
        let mut stale: Vec<Page> = self
            .pages
            .iter()
            .filter(|entry| entry.kb_id == kb_id && entry.indexed_content_hash.as_ref() != Some(&entry.content_hash))
            .map(|entry| entry.clone())
            .collect();
        stale.sort_by_key(|p| p.last_crawled_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn replace_chunks(&self, page_id: Uuid, chunks: Vec<Chunk>) -> AppResult<()> {
        if let Some((_, old_ids)) = self.chunks_by_page.remove(&page_id) {
            for id in old_ids {
                self.chunks.remove(&id);
            }
        }
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(chunk.id);
            self.chunks.insert(chunk.id, chunk);
        }
        self.chunks_by_page.insert(page_id, ids);
        Ok(())
    }

    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: Vec<f32>, model: &str) -> AppResult<()> {
        if let Some(mut chunk) = self.chunks.get_mut(&chunk_id) {
            chunk.embedding = Some(embedding);
            chunk.embedding_model = Some(model.to_string());
            Ok(())
        } else {
            Err(AppError::NotFound(format!("chunk {chunk_id} not found")))
        }
    }

    async fn chunks_missing_embeddings(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Chunk>> {
        Ok(self
            .chunks
            .iter()
            .filter(|entry| entry.kb_id == kb_id && entry.embedding.is_none())
            .take(limit)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn vector_search(&self, kb_id: Uuid, query_embedding: &[f32], top_k: usize) -> AppResult<Vec<RetrievedChunk>> {
        let mut scored: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .filter(|entry| entry.kb_id == kb_id)
            .filter_map(|entry| {
                entry
                    .embedding
                    .as_ref()
                    .map(|emb| Self::retrieved_from_chunk(&entry, cosine(emb, query_embedding)))
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn fts_search(&self, kb_id: Uuid, query: &str, top_k: usize) -> AppResult<Vec<RetrievedChunk>> {
        let mut scored: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .filter(|entry| entry.kb_id == kb_id)
            .filter_map(|entry| {
                let score = lexical_score(query, &entry.chunk_text);
                if score > 0.0 {
                    Some(Self::retrieved_from_chunk(&entry, score))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn find_chunks_containing(&self, needle: &str, limit: usize) -> AppResult<Vec<RetrievedChunk>> {
        let needle = needle.to_lowercase();
        Ok(self
            .chunks
            .iter()
            .filter(|entry| entry.chunk_text.to_lowercase().contains(&needle))
            .take(limit)
            .map(|entry| Self::retrieved_from_chunk(&entry, 1.0))
            .collect())
    }

    async fn get_contract_info(&self, address: &str) -> AppResult<Option<ContractInfo>> {
        Ok(self.contracts.get(&address.to_lowercase()).map(|c| c.clone()))
    }

    async fn upsert_contract_info(&self, info: ContractInfo) -> AppResult<ContractInfo> {
        let key = info.address.to_lowercase();
        let winner = match self.contracts.get(&key) {
            Some(existing) if existing.confidence > info.confidence => existing.clone(),
            Some(existing) if existing.confidence == info.confidence && existing.updated_at >= info.updated_at => {
                existing.clone()
            }
            _ => info,
        };
        self.contracts.insert(key, winner.clone());
        Ok(winner)
    }

    async fn protocol_stats(&self) -> AppResult<Vec<(String, i64)>> {
        let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for entry in self.contracts.iter() {
            let protocol = entry.protocol.clone().unwrap_or_else(|| "unknown".to_string());
            *counts.entry(protocol).or_insert(0) += 1;
        }
        let mut rows: Vec<(String, i64)> = counts.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(rows)
    }

    async fn scan_chunks_with_addresses(&self, kb_id: Uuid, offset: usize, limit: usize) -> AppResult<Vec<RetrievedChunk>> {
        let address_re = regex::Regex::new(r"0x[a-fA-F0-9]{40}").unwrap();
        Ok(self
            .chunks
            .iter()
            .filter(|entry| entry.kb_id == kb_id && address_re.is_match(&entry.chunk_text))
            .skip(offset)
            .take(limit)
            .map(|entry| Self::retrieved_from_chunk(&entry, 1.0))
            .collect())
    }

    async fn enqueue_job(&self, job: Job) -> AppResult<()> {
        self.job_order.lock().unwrap().push(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        Ok(self.jobs.get(id).map(|j| j.clone()))
    }

    async fn claim_next_job(&self) -> AppResult<Option<Job>> {
        let order = self.job_order.lock().unwrap().clone();
        for id in order {
            if let Some(mut job) = self.jobs.get_mut(&id) {
                if job.status == JobStatus::Queued {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now());
                    job.error.clear();
                    self.job_seq.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn requeue_stale_jobs(&self, stale_after_s: f64) -> AppResult<usize> {
        let threshold = Utc::now() - chrono::Duration::milliseconds((stale_after_s * 1000.0) as i64);
        let mut count = 0;
        for mut entry in self.jobs.iter_mut() {
            if entry.status == JobStatus::Running {
                if let Some(started) = entry.started_at {
                    if started < threshold {
                        entry.status = JobStatus::Queued;
                        entry.error = format!("{}requeued: stale after {}s", entry.error, stale_after_s);
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }

    async fn update_job(&self, job: Job) -> AppResult<()> {
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn create_file_batch(&self, batch: FileBatch) -> AppResult<FileBatch> {
        self.file_batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn update_file_batch(&self, batch: FileBatch) -> AppResult<()> {
        self.file_batches.insert(batch.id, batch);
        Ok(())
    }

    async fn record_feedback(&self, feedback: Feedback) -> AppResult<Feedback> {
        let key = (feedback.conversation_id.clone(), feedback.message_id.clone());
        self.feedback.insert(key, feedback.clone());
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk(kb_id: Uuid, page_id: Uuid, text: &str, embedding: Option<Vec<f32>>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            page_id,
            kb_id,
            chunk_index: 0,
            section_path: "Intro".into(),
            chunk_text: text.into(),
            chunk_hash: "hash".into(),
            token_count: text.split_whitespace().count() as i32,
            embedding,
            embedding_model: None,
            url: "https://example.com/doc".into(),
            title: "Doc".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine_similarity() {
        let store = MemoryStore::new();
        let kb = store.get_or_create_kb("ws", "kb").await.unwrap();
        let page_id = Uuid::new_v4();
        let chunks = vec![
            sample_chunk(kb.id, page_id, "a", Some(vec![1.0, 0.0])),
            sample_chunk(kb.id, page_id, "b", Some(vec![0.0, 1.0])),
        ];
        store.replace_chunks(page_id, chunks).await.unwrap();

        let results = store.vector_search(kb.id, &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn claim_next_job_is_fifo_and_marks_running() {
        let store = MemoryStore::new();
        store.enqueue_job(Job::new("j1".into(), JobType::Crawl, serde_json::json!({}))).await.unwrap();
        store.enqueue_job(Job::new("j2".into(), JobType::Index, serde_json::json!({}))).await.unwrap();

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, "j1");
        assert_eq!(claimed.status, JobStatus::Running);

        let next = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(next.id, "j2");
    }

    #[tokio::test]
    async fn contract_upsert_never_downgrades_confidence() {
        let store = MemoryStore::new();
        let high = ContractInfo {
            address: "0xabc0000000000000000000000000000000000a".into(),
            protocol: Some("Aave".into()),
            protocol_version: Some("V3".into()),
            contract_type: Some("Pool".into()),
            contract_name: None,
            source_url: None,
            confidence: 0.9,
            chain_id: 1,
            updated_at: Utc::now(),
        };
        store.upsert_contract_info(high.clone()).await.unwrap();

        let low = ContractInfo { confidence: 0.7, contract_type: None, ..high.clone() };
        let result = store.upsert_contract_info(low).await.unwrap();
        assert_eq!(result.confidence, 0.9);
        assert_eq!(result.contract_type.as_deref(), Some("Pool"));
    }
}
