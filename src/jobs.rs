//! Job worker (spec §4.12): polls the jobs table, requeues stale `running`
//! jobs, claims the oldest `queued` job, and dispatches by job type. Grounded
//! in `original_source/.../worker.py` and the teacher's background-task
//! spawn pattern.

use crate::config::{Config, WorkerConfig};
use crate::embedding::EmbeddingBackend;
use crate::ingest::chunker::{chunk_markdown_by_headers, preprocess_for_search};
use crate::ingest::crawler::{self, CrawlOptions};
use crate::ingest::files;
use crate::store::types::{Chunk, FileBatch, FileBatchStatus, Job, JobStatus, JobType, Page};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

pub struct Worker {
    store: Arc<dyn Store>,
    embeddings: Arc<dyn EmbeddingBackend>,
    config: WorkerConfig,
    chunk_max_chars: usize,
    chunk_overlap_chars: usize,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, embeddings: Arc<dyn EmbeddingBackend>, config: &Config) -> Self {
        Worker {
            store,
            embeddings,
            config: config.worker.clone(),
            chunk_max_chars: config.chunking.max_chars,
            chunk_overlap_chars: config.chunking.overlap_chars,
        }
    }

    /// Runs the poll loop until `shutdown` resolves. One tick: requeue stale
    /// jobs, claim and run the next queued job (if any), sleep otherwise.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.store.requeue_stale_jobs(self.config.stale_after.as_secs_f64()).await {
                Ok(n) if n > 0 => tracing::info!(count = n, "requeued stale running jobs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to requeue stale jobs"),
            }

            match self.store.claim_next_job().await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to claim next job");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn run_job(&self, mut job: Job) {
        let mut progress = job.progress.as_object().cloned().unwrap_or_default();
        let mut meta = progress.get("_meta").and_then(|m| m.as_object()).cloned().unwrap_or_default();
        let attempts = meta.get("attempts").and_then(|a| a.as_u64()).unwrap_or(0) + 1;
        meta.insert("attempts".into(), serde_json::json!(attempts));
        progress.insert("_meta".into(), serde_json::json!(meta));
        job.progress = serde_json::Value::Object(progress);

        let result = match job.job_type {
            JobType::Crawl => self.run_crawl(&job).await,
            JobType::Index => self.run_index(&job).await,
            JobType::FileProcess => self.run_file_process(&job).await,
        };

        match result {
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.finished_at = Some(Utc::now());
                job.error.clear();
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "job execution failed");
                job.error = e.to_string();
                if attempts < self.config.max_attempts as u64 {
                    job.status = JobStatus::Queued;
                    job.started_at = None;
                } else {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(Utc::now());
                }
            }
        }

        if let Err(e) = self.store.update_job(job).await {
            tracing::error!(error = %e, "failed to persist job state after run");
        }
    }

    async fn run_crawl(&self, job: &Job) -> anyhow::Result<()> {
        let payload = &job.payload;
        let kb_id: Uuid = payload
            .get("kb_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("crawl job missing kb_id"))?;

        let options = CrawlOptions {
            sitemap_url: payload.get("sitemap_url").and_then(|v| v.as_str()).map(String::from),
            seed_urls: payload
                .get("seed_urls")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            include_patterns: payload
                .get("include_patterns")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            exclude_patterns: payload
                .get("exclude_patterns")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            max_pages: payload.get("max_pages").and_then(|v| v.as_u64()).map(|n| n as usize).unwrap_or(500),
            max_depth: payload.get("max_depth").and_then(|v| v.as_u64()).map(|n| n as u8).unwrap_or(3),
            same_domain_only: payload.get("same_domain_only").and_then(|v| v.as_bool()).unwrap_or(true),
        };

        let result = crawler::crawl(self.store.as_ref(), kb_id, options).await?;
        tracing::info!(kb_id = %kb_id, crawled = result.pages_crawled, errors = result.errors.len(), "crawl job finished");
        Ok(())
    }

    async fn run_index(&self, job: &Job) -> anyhow::Result<()> {
        let kb_id: Uuid = job
            .payload
            .get("kb_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("index job missing kb_id"))?;

        self.reindex_pages_needing_update(kb_id).await
    }

    /// Walks pages whose `content_hash != indexed_content_hash`, regenerating
    /// chunks and embeddings and stamping `indexed_content_hash` (spec §4.12
    /// `index` dispatch). Chunks + embeds every such page via `index_page`
    /// first, then backfills any chunk left without an embedding by that or
    /// any other path.
    async fn reindex_pages_needing_update(&self, kb_id: Uuid) -> anyhow::Result<()> {
        loop {
            let stale = self.store.pages_needing_reindex(kb_id, 64).await?;
            if stale.is_empty() {
                break;
            }
            for page in stale {
                self.index_page(page).await?;
            }
        }

        loop {
            let missing = self.store.chunks_missing_embeddings(kb_id, 64).await?;
            if missing.is_empty() {
                break;
            }
            let texts: Vec<String> = missing.iter().map(|c| c.chunk_text.clone()).collect();
            let embeddings = self.embeddings.embed_documents(&texts).await?;
            for (chunk, embedding) in missing.into_iter().zip(embeddings.into_iter()) {
                self.store.set_chunk_embedding(chunk.id, embedding, "default").await?;
            }
        }
        Ok(())
    }

    /// Chunks and embeds a single freshly-upserted page, marking its
    /// `indexed_content_hash` up to date.
    pub async fn index_page(&self, mut page: Page) -> anyhow::Result<()> {
        let items = chunk_markdown_by_headers(&page.content_markdown, self.chunk_max_chars, self.chunk_overlap_chars);
        let mut chunks = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let processed = preprocess_for_search(&item.text);
            chunks.push(Chunk {
                id: Uuid::new_v4(),
                page_id: page.id,
                kb_id: page.kb_id,
                chunk_index: i as i32,
                section_path: item.section_path.clone(),
                chunk_text: processed.clone(),
                chunk_hash: crate::ingest::chunker::chunk_hash(&processed),
                token_count: processed.split_whitespace().count() as i32,
                embedding: None,
                embedding_model: None,
                url: page.url.clone(),
                title: page.title.clone(),
                created_at: Utc::now(),
            });
        }
        self.store.replace_chunks(page.id, chunks).await?;

        page.indexed_content_hash = Some(page.content_hash.clone());
        self.store.upsert_page(page).await?;
        Ok(())
    }

    async fn run_file_process(&self, job: &Job) -> anyhow::Result<()> {
        let payload = &job.payload;
        let kb_id: Uuid = payload
            .get("kb_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("file_process job missing kb_id"))?;
        let batch_id: Uuid = payload
            .get("batch_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("file_process job missing batch_id"))?;

        let items = payload
            .get("files")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("file_process job missing files[]"))?;

        let mut results = std::collections::HashMap::new();
        let mut any_ok = false;
        let mut any_err = false;

        for item in items {
            let filename = item.get("filename").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let bytes: Vec<u8> = item
                .get("bytes_b64")
                .and_then(|v| v.as_str())
                .and_then(|s| base64_decode(s).ok())
                .unwrap_or_default();

            match files::extract_text(&filename, &bytes) {
                Ok(markdown) => {
                    let url = format!("file://{batch_id}/{filename}");
                    let hash = crate::ingest::chunker::chunk_hash(&markdown);
                    let page = Page {
                        id: Uuid::new_v4(),
                        kb_id,
                        url: url.clone(),
                        title: filename.clone(),
                        content_markdown: markdown,
                        content_hash: hash,
                        indexed_content_hash: None,
                        http_status: Some(200),
                        last_crawled_at: Some(Utc::now()),
                        meta: serde_json::json!({ "batch_id": batch_id }),
                    };
                    let stored = self.store.upsert_page(page).await?;
                    self.index_page(stored).await?;
                    results.insert(filename, "ok".to_string());
                    any_ok = true;
                }
                Err(e) => {
                    results.insert(filename, format!("error: {e}"));
                    any_err = true;
                }
            }
        }

        let status = match (any_ok, any_err) {
            (true, false) => FileBatchStatus::Completed,
            (true, true) => FileBatchStatus::Partial,
            (false, _) => FileBatchStatus::Failed,
        };
        self.store.update_file_batch(FileBatch { id: batch_id, kb_id, status, results }).await?;
        Ok(())
    }
}

fn base64_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).map_err(|e| anyhow::anyhow!("base64 decode: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::FakeEmbeddings;
    use crate::store::memory::MemoryStore;

    fn test_config() -> Config {
        Config::from_env(Some(0), Some("./data".into()))
    }

    #[tokio::test]
    async fn run_file_process_indexes_a_text_file() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let embeddings: Arc<dyn EmbeddingBackend> = Arc::new(FakeEmbeddings::new(8));
        let config = test_config();
        let worker = Worker::new(store.clone(), embeddings, &config);

        let kb = store.get_or_create_kb("default", "docs").await.unwrap();
        let batch_id = Uuid::new_v4();
        let batch = store.create_file_batch(FileBatch { id: batch_id, kb_id: kb.id, status: FileBatchStatus::Pending, results: Default::default() }).await.unwrap();

        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"# Title\n\nSome content.");
        let job = Job::new(
            "job-1".into(),
            JobType::FileProcess,
            serde_json::json!({
                "kb_id": kb.id.to_string(),
                "batch_id": batch.id.to_string(),
                "files": [{ "filename": "notes.md", "bytes_b64": encoded }],
            }),
        );

        worker.run_file_process(&job).await.unwrap();
        let page = store.get_page_by_url(&format!("file://{}/notes.md", batch.id)).await.unwrap();
        assert!(page.is_some());
    }
}
