//! The `Store` trait: a narrow abstraction over a relational store with
//! unique constraints, full-text search, vector similarity ordering, and
//! `FOR UPDATE SKIP LOCKED` job claiming (spec §6). This crate does not
//! implement a database from scratch; it adapts to one.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod types;

use crate::error::AppResult;
use async_trait::async_trait;
use types::*;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // -- workspaces / knowledge bases --
    async fn get_or_create_kb(&self, workspace_name: &str, kb_slug: &str) -> AppResult<KnowledgeBase>;
    async fn get_kb(&self, kb_id: Uuid) -> AppResult<Option<KnowledgeBase>>;

    // -- pages --
    /// Insert or update a page keyed by `url`, returning the stored row.
    /// Unique on `url`.
    async fn upsert_page(&self, page: Page) -> AppResult<Page>;
    async fn get_page_by_url(&self, url: &str) -> AppResult<Option<Page>>;
    /// Pages in `kb_id` whose `content_hash != indexed_content_hash` (including
    /// never-indexed pages, where `indexed_content_hash` is `None`), oldest
    /// `last_crawled_at` first, capped at `limit` (spec §4.12 `index` dispatch).
    async fn pages_needing_reindex(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Page>>;

    // -- chunks --
    /// Replace all chunks for a page with a new set, unique on
    /// `(page_id, chunk_index)`.
    async fn replace_chunks(&self, page_id: Uuid, chunks: Vec<Chunk>) -> AppResult<()>;
    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: Vec<f32>, model: &str) -> AppResult<()>;
    async fn chunks_missing_embeddings(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Chunk>>;

    /// Cosine-similarity vector search scoped to a knowledge base.
    async fn vector_search(&self, kb_id: Uuid, query_embedding: &[f32], top_k: usize) -> AppResult<Vec<RetrievedChunk>>;

    /// Full-text search scoped to a knowledge base, using the configured
    /// FTS analyzer config.
    async fn fts_search(&self, kb_id: Uuid, query: &str, top_k: usize) -> AppResult<Vec<RetrievedChunk>>;

    async fn find_chunks_containing(&self, needle: &str, limit: usize) -> AppResult<Vec<RetrievedChunk>>;

    // -- contract index --
    async fn get_contract_info(&self, address: &str) -> AppResult<Option<ContractInfo>>;
    /// Insert-or-update on conflict of `address`; never downgrades confidence
    /// (spec §9 open-question resolution #3).
    async fn upsert_contract_info(&self, info: ContractInfo) -> AppResult<ContractInfo>;
    async fn protocol_stats(&self) -> AppResult<Vec<(String, i64)>>;
    async fn scan_chunks_with_addresses(&self, kb_id: Uuid, offset: usize, limit: usize) -> AppResult<Vec<RetrievedChunk>>;

    // -- jobs --
    async fn enqueue_job(&self, job: Job) -> AppResult<()>;
    async fn get_job(&self, id: &str) -> AppResult<Option<Job>>;
    /// `SELECT ... FOR UPDATE SKIP LOCKED` claim semantics: atomically
    /// claims the oldest queued job and marks it running.
    async fn claim_next_job(&self) -> AppResult<Option<Job>>;
    /// Requeues jobs stuck in `running` past `stale_after_s`, returns count.
    async fn requeue_stale_jobs(&self, stale_after_s: f64) -> AppResult<usize>;
    async fn update_job(&self, job: Job) -> AppResult<()>;

    // -- file batches --
    async fn create_file_batch(&self, batch: FileBatch) -> AppResult<FileBatch>;
    async fn update_file_batch(&self, batch: FileBatch) -> AppResult<()>;

    // -- feedback --
    /// Unique on `(conversation_id, message_id)`.
    async fn record_feedback(&self, feedback: Feedback) -> AppResult<Feedback>;
}
