//! Postgres + pgvector backing store (feature `postgres`). Grounded in
//! `onekey_rag_service.db` (HNSW/IVFFLAT vector index setup, GIN tsvector
//! FTS index) and `onekey_rag_service.worker` (`FOR UPDATE SKIP LOCKED`
//! claim pattern).

use super::types::*;
use super::Store;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, embedding_dim: usize) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("postgres connect: {e}")))?;

        let store = PostgresStore { pool };
        store.ensure_schema(embedding_dim).await?;
        Ok(store)
    }

    /// Idempotent schema setup: pgvector extension, embedding column
    /// dimension fix-up, HNSW index, FTS GIN index. Mirrors
    /// `db.ensure_pgvector_extension` / `_ensure_embedding_dimension` /
    /// `_ensure_pgvector_index` / `_ensure_fts_index`.
    async fn ensure_schema(&self, embedding_dim: usize) -> AppResult<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("pgvector extension: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id UUID PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS knowledge_bases (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id),
                slug TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE(workspace_id, slug)
            );
            CREATE TABLE IF NOT EXISTS pages (
                id UUID PRIMARY KEY,
                kb_id UUID NOT NULL REFERENCES knowledge_bases(id),
                url TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                content_markdown TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                indexed_content_hash TEXT,
                http_status INT,
                last_crawled_at TIMESTAMPTZ,
                meta JSONB NOT NULL DEFAULT '{}'::jsonb
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id UUID PRIMARY KEY,
                page_id UUID NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
                kb_id UUID NOT NULL,
                chunk_index INT NOT NULL,
                section_path TEXT NOT NULL DEFAULT '',
                chunk_text TEXT NOT NULL,
                chunk_hash TEXT NOT NULL,
                token_count INT NOT NULL DEFAULT 0,
                embedding vector,
                embedding_model TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE(page_id, chunk_index)
            );
            CREATE TABLE IF NOT EXISTS contract_index (
                address TEXT PRIMARY KEY,
                protocol TEXT,
                protocol_version TEXT,
                contract_type TEXT,
                contract_name TEXT,
                source_url TEXT,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0.7,
                chain_id BIGINT NOT NULL DEFAULT 1,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                progress JSONB NOT NULL DEFAULT '{}'::jsonb,
                error TEXT NOT NULL DEFAULT '',
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ
            );
            CREATE TABLE IF NOT EXISTS feedback (
                id UUID PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                rating TEXT NOT NULL,
                reason TEXT,
                comment TEXT,
                sources JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE(conversation_id, message_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DependencyUnavailable(format!("schema init: {e}")))?;

        // Fix up the embedding column's declared dimension if it drifted.
        sqlx::query(&format!(
            "ALTER TABLE chunks ALTER COLUMN embedding TYPE vector({embedding_dim})"
        ))
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS chunks_embedding_hnsw_idx ON chunks \
             USING hnsw (embedding vector_cosine_ops) WITH (m = 16, ef_construction = 64)",
        )
        .execute(&self.pool)
        .await
        .ok();

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS chunks_fts_idx ON chunks \
             USING gin (to_tsvector('simple', chunk_text))",
        )
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    fn retrieved_from_row(row: &sqlx::postgres::PgRow) -> AppResult<RetrievedChunk> {
        Ok(RetrievedChunk {
            chunk_id: row.try_get("id").map_err(sqlx_err)?,
            kb_id: row.try_get("kb_id").map_err(sqlx_err)?,
            url: row.try_get("url").map_err(sqlx_err)?,
            title: row.try_get("title").map_err(sqlx_err)?,
            section_path: row.try_get("section_path").map_err(sqlx_err)?,
            text: row.try_get("chunk_text").map_err(sqlx_err)?,
            score: row.try_get::<f64, _>("score").map_err(sqlx_err)?,
        })
    }
}

fn sqlx_err(e: sqlx::Error) -> AppError {
    AppError::DependencyLogic(format!("postgres: {e}"))
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_or_create_kb(&self, workspace_name: &str, kb_slug: &str) -> AppResult<KnowledgeBase> {
        let workspace_id: Uuid = sqlx::query_scalar(
            "INSERT INTO workspaces (id, name) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_name)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        let row = sqlx::query(
            "INSERT INTO knowledge_bases (id, workspace_id, slug, name) VALUES ($1, $2, $3, $3) \
             ON CONFLICT (workspace_id, slug) DO UPDATE SET slug = EXCLUDED.slug \
             RETURNING id, workspace_id, slug, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(kb_slug)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(KnowledgeBase {
            id: row.try_get("id").map_err(sqlx_err)?,
            workspace_id: row.try_get("workspace_id").map_err(sqlx_err)?,
            slug: row.try_get("slug").map_err(sqlx_err)?,
            name: row.try_get("name").map_err(sqlx_err)?,
            created_at: row.try_get("created_at").map_err(sqlx_err)?,
        })
    }

    async fn get_kb(&self, kb_id: Uuid) -> AppResult<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT id, workspace_id, slug, name, created_at FROM knowledge_bases WHERE id = $1")
            .bind(kb_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(row.map(|r| KnowledgeBase {
            id: r.get("id"),
            workspace_id: r.get("workspace_id"),
            slug: r.get("slug"),
            name: r.get("name"),
            created_at: r.get("created_at"),
        }))
    }

    async fn upsert_page(&self, page: Page) -> AppResult<Page> {
        let row = sqlx::query(
            "INSERT INTO pages (id, kb_id, url, title, content_markdown, content_hash, \
             indexed_content_hash, http_status, last_crawled_at, meta) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (url) DO UPDATE SET \
             title = EXCLUDED.title, content_markdown = EXCLUDED.content_markdown, \
             content_hash = EXCLUDED.content_hash, http_status = EXCLUDED.http_status, \
             last_crawled_at = EXCLUDED.last_crawled_at, meta = EXCLUDED.meta \
             RETURNING id, kb_id, url, title, content_markdown, content_hash, \
             indexed_content_hash, http_status, last_crawled_at, meta",
        )
        .bind(page.id)
        .bind(page.kb_id)
        .bind(&page.url)
        .bind(&page.title)
        .bind(&page.content_markdown)
        .bind(&page.content_hash)
        .bind(&page.indexed_content_hash)
        .bind(page.http_status.map(|s| s as i32))
        .bind(page.last_crawled_at)
        .bind(&page.meta)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(Page {
            id: row.get("id"),
            kb_id: row.get("kb_id"),
            url: row.get("url"),
            title: row.get("title"),
            content_markdown: row.get("content_markdown"),
            content_hash: row.get("content_hash"),
            indexed_content_hash: row.get("indexed_content_hash"),
            http_status: row.try_get::<Option<i32>, _>("http_status").ok().flatten().map(|v| v as u16),
            last_crawled_at: row.get("last_crawled_at"),
            meta: row.get("meta"),
        })
    }

    async fn get_page_by_url(&self, url: &str) -> AppResult<Option<Page>> {
        let row = sqlx::query(
            "SELECT id, kb_id, url, title, content_markdown, content_hash, \
             indexed_content_hash, http_status, last_crawled_at, meta FROM pages WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(row.map(|row| Page {
            id: row.get("id"),
            kb_id: row.get("kb_id"),
            url: row.get("url"),
            title: row.get("title"),
            content_markdown: row.get("content_markdown"),
            content_hash: row.get("content_hash"),
            indexed_content_hash: row.get("indexed_content_hash"),
            http_status: row.try_get::<Option<i32>, _>("http_status").ok().flatten().map(|v| v as u16),
            last_crawled_at: row.get("last_crawled_at"),
            meta: row.get("meta"),
        }))
    }

    async fn pages_needing_reindex(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Page>> {
        let rows = sqlx::query(
            "SELECT id, kb_id, url, title, content_markdown, content_hash, \
             indexed_content_hash, http_status, last_crawled_at, meta FROM pages \
             WHERE kb_id = $1 AND (indexed_content_hash IS NULL OR indexed_content_hash != content_hash) \
             ORDER BY last_crawled_at ASC NULLS FIRST LIMIT $2",
        )
        .bind(kb_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Page {
                id: row.get("id"),
                kb_id: row.get("kb_id"),
                url: row.get("url"),
                title: row.get("title"),
                content_markdown: row.get("content_markdown"),
                content_hash: row.get("content_hash"),
                indexed_content_hash: row.get("indexed_content_hash"),
                http_status: row.try_get::<Option<i32>, _>("http_status").ok().flatten().map(|v| v as u16),
                last_crawled_at: row.get("last_crawled_at"),
                meta: row.get("meta"),
            })
            .collect())
    }

    async fn replace_chunks(&self, page_id: Uuid, chunks: Vec<Chunk>) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        sqlx::query("DELETE FROM chunks WHERE page_id = $1")
            .bind(page_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        for chunk in chunks {
            let embedding = chunk.embedding.map(Vector::from);
            sqlx::query(
                "INSERT INTO chunks (id, page_id, kb_id, chunk_index, section_path, chunk_text, \
                 chunk_hash, token_count, embedding, embedding_model) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(chunk.id)
            .bind(chunk.page_id)
            .bind(chunk.kb_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.section_path)
            .bind(&chunk.chunk_text)
            .bind(&chunk.chunk_hash)
            .bind(chunk.token_count)
            .bind(embedding)
            .bind(&chunk.embedding_model)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        }

        tx.commit().await.map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_chunk_embedding(&self, chunk_id: Uuid, embedding: Vec<f32>, model: &str) -> AppResult<()> {
        sqlx::query("UPDATE chunks SET embedding = $1, embedding_model = $2 WHERE id = $3")
            .bind(Vector::from(embedding))
            .bind(model)
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn chunks_missing_embeddings(&self, kb_id: Uuid, limit: usize) -> AppResult<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT c.id, c.page_id, c.kb_id, c.chunk_index, c.section_path, c.chunk_text, \
             c.chunk_hash, c.token_count, c.embedding_model, c.created_at, p.url, p.title \
             FROM chunks c JOIN pages p ON p.id = c.page_id \
             WHERE c.kb_id = $1 AND c.embedding IS NULL LIMIT $2",
        )
        .bind(kb_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Chunk {
                id: row.get("id"),
                page_id: row.get("page_id"),
                kb_id: row.get("kb_id"),
                chunk_index: row.get("chunk_index"),
                section_path: row.get("section_path"),
                chunk_text: row.get("chunk_text"),
                chunk_hash: row.get("chunk_hash"),
                token_count: row.get("token_count"),
                embedding: None,
                embedding_model: row.get("embedding_model"),
                url: row.get("url"),
                title: row.get("title"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn vector_search(&self, kb_id: Uuid, query_embedding: &[f32], top_k: usize) -> AppResult<Vec<RetrievedChunk>> {
        let vector = Vector::from(query_embedding.to_vec());
        let rows = sqlx::query(
            "SELECT c.id, c.kb_id, p.url, p.title, c.section_path, c.chunk_text, \
             1 - (c.embedding <=> $1) AS score \
             FROM chunks c JOIN pages p ON p.id = c.page_id \
             WHERE c.kb_id = $2 AND c.embedding IS NOT NULL \
             ORDER BY c.embedding <=> $1 LIMIT $3",
        )
        .bind(vector)
        .bind(kb_id)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.iter().map(Self::retrieved_from_row).collect()
    }

    async fn fts_search(&self, kb_id: Uuid, query: &str, top_k: usize) -> AppResult<Vec<RetrievedChunk>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kb_id, p.url, p.title, c.section_path, c.chunk_text, \
             ts_rank(to_tsvector('simple', c.chunk_text), plainto_tsquery('simple', $1)) AS score \
             FROM chunks c JOIN pages p ON p.id = c.page_id \
             WHERE c.kb_id = $2 AND to_tsvector('simple', c.chunk_text) @@ plainto_tsquery('simple', $1) \
             ORDER BY score DESC LIMIT $3",
        )
        .bind(query)
        .bind(kb_id)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.iter().map(Self::retrieved_from_row).collect()
    }

    async fn find_chunks_containing(&self, needle: &str, limit: usize) -> AppResult<Vec<RetrievedChunk>> {
        let pattern = format!("%{}%", needle.to_lowercase());
        let rows = sqlx::query(
            "SELECT c.id, c.kb_id, p.url, p.title, c.section_path, c.chunk_text, 1.0 AS score \
             FROM chunks c JOIN pages p ON p.id = c.page_id \
             WHERE LOWER(c.chunk_text) LIKE $1 LIMIT $2",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.iter().map(Self::retrieved_from_row).collect()
    }

    async fn get_contract_info(&self, address: &str) -> AppResult<Option<ContractInfo>> {
        let row = sqlx::query(
            "SELECT address, protocol, protocol_version, contract_type, contract_name, \
             source_url, confidence, chain_id, updated_at FROM contract_index WHERE address = $1",
        )
        .bind(address.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(row.map(|r| ContractInfo {
            address: r.get("address"),
            protocol: r.get("protocol"),
            protocol_version: r.get("protocol_version"),
            contract_type: r.get("contract_type"),
            contract_name: r.get("contract_name"),
            source_url: r.get("source_url"),
            confidence: r.get("confidence"),
            chain_id: r.get("chain_id"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn upsert_contract_info(&self, info: ContractInfo) -> AppResult<ContractInfo> {
        // Never downgrade confidence: read-modify-write inside a single round
        // trip via conditional ON CONFLICT clause.
        let row = sqlx::query(
            "INSERT INTO contract_index (address, protocol, protocol_version, contract_type, \
             contract_name, source_url, confidence, chain_id, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (address) DO UPDATE SET \
             protocol = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.protocol ELSE contract_index.protocol END, \
             protocol_version = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.protocol_version ELSE contract_index.protocol_version END, \
             contract_type = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.contract_type ELSE contract_index.contract_type END, \
             contract_name = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.contract_name ELSE contract_index.contract_name END, \
             source_url = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.source_url ELSE contract_index.source_url END, \
             confidence = GREATEST(EXCLUDED.confidence, contract_index.confidence), \
             updated_at = CASE WHEN EXCLUDED.confidence >= contract_index.confidence THEN EXCLUDED.updated_at ELSE contract_index.updated_at END \
             RETURNING address, protocol, protocol_version, contract_type, contract_name, \
             source_url, confidence, chain_id, updated_at",
        )
        .bind(&info.address.to_lowercase())
        .bind(&info.protocol)
        .bind(&info.protocol_version)
        .bind(&info.contract_type)
        .bind(&info.contract_name)
        .bind(&info.source_url)
        .bind(info.confidence)
        .bind(info.chain_id)
        .bind(info.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(ContractInfo {
            address: row.get("address"),
            protocol: row.get("protocol"),
            protocol_version: row.get("protocol_version"),
            contract_type: row.get("contract_type"),
            contract_name: row.get("contract_name"),
            source_url: row.get("source_url"),
            confidence: row.get("confidence"),
            chain_id: row.get("chain_id"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn protocol_stats(&self) -> AppResult<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT COALESCE(protocol, 'unknown') AS protocol, COUNT(*) AS n \
             FROM contract_index GROUP BY protocol ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(rows.into_iter().map(|r| (r.get("protocol"), r.get("n"))).collect())
    }

    async fn scan_chunks_with_addresses(&self, kb_id: Uuid, offset: usize, limit: usize) -> AppResult<Vec<RetrievedChunk>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kb_id, p.url, p.title, c.section_path, c.chunk_text, 1.0 AS score \
             FROM chunks c JOIN pages p ON p.id = c.page_id \
             WHERE c.kb_id = $1 AND c.chunk_text ~ '0x[a-fA-F0-9]{40}' \
             ORDER BY c.id OFFSET $2 LIMIT $3",
        )
        .bind(kb_id)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.iter().map(Self::retrieved_from_row).collect()
    }

    async fn enqueue_job(&self, job: Job) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, payload, progress, error, started_at, finished_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&job.id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(&job.progress)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, job_type, status, payload, progress, error, started_at, finished_at \
             FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(row.map(row_to_job))
    }

    async fn claim_next_job(&self) -> AppResult<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let row = sqlx::query(
            "SELECT id, job_type, status, payload, progress, error, started_at, finished_at \
             FROM jobs WHERE status = 'queued' ORDER BY started_at ASC NULLS FIRST, id ASC \
             LIMIT 1 FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(sqlx_err)?;
            return Ok(None);
        };
        let mut job = row_to_job(row);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.error.clear();

        sqlx::query("UPDATE jobs SET status = 'running', started_at = $2, error = '' WHERE id = $1")
            .bind(&job.id)
            .bind(job.started_at)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(Some(job))
    }

    async fn requeue_stale_jobs(&self, stale_after_s: f64) -> AppResult<usize> {
        let threshold = Utc::now() - chrono::Duration::milliseconds((stale_after_s * 1000.0) as i64);
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'running' AND started_at < $1 \
             ORDER BY started_at ASC LIMIT 10 FOR UPDATE SKIP LOCKED",
        )
        .bind(threshold)
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        let count = rows.len();
        for row in rows {
            let id: String = row.get("id");
            sqlx::query(
                "UPDATE jobs SET status = 'queued', \
                 error = error || $2 WHERE id = $1",
            )
            .bind(&id)
            .bind(format!("requeued: stale after {stale_after_s}s; "))
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        }
        tx.commit().await.map_err(sqlx_err)?;
        Ok(count)
    }

    async fn update_job(&self, job: Job) -> AppResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = $2, progress = $3, error = $4, started_at = $5, finished_at = $6 \
             WHERE id = $1",
        )
        .bind(&job.id)
        .bind(job.status.as_str())
        .bind(&job.progress)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn create_file_batch(&self, batch: FileBatch) -> AppResult<FileBatch> {
        // File batches piggyback on the jobs table's JSON payload in the
        // Postgres backend rather than a dedicated table, since they are
        // always owned by exactly one `file_process` job.
        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, payload) VALUES ($1, 'file_process', 'queued', $2) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(batch.id.to_string())
        .bind(serde_json::to_value(&batch).map_err(|e| AppError::Validation(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(batch)
    }

    async fn update_file_batch(&self, batch: FileBatch) -> AppResult<()> {
        sqlx::query("UPDATE jobs SET payload = $2 WHERE id = $1")
            .bind(batch.id.to_string())
            .bind(serde_json::to_value(&batch).map_err(|e| AppError::Validation(e.to_string()))?)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn record_feedback(&self, feedback: Feedback) -> AppResult<Feedback> {
        let row = sqlx::query(
            "INSERT INTO feedback (id, conversation_id, message_id, rating, reason, comment, sources) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (conversation_id, message_id) DO UPDATE SET \
             rating = EXCLUDED.rating, reason = EXCLUDED.reason, comment = EXCLUDED.comment, sources = EXCLUDED.sources \
             RETURNING id, conversation_id, message_id, rating, reason, comment, sources, created_at",
        )
        .bind(feedback.id)
        .bind(&feedback.conversation_id)
        .bind(&feedback.message_id)
        .bind(&feedback.rating)
        .bind(&feedback.reason)
        .bind(&feedback.comment)
        .bind(&feedback.sources)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(Feedback {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            message_id: row.get("message_id"),
            rating: row.get("rating"),
            reason: row.get("reason"),
            comment: row.get("comment"),
            sources: row.get("sources"),
            created_at: row.get("created_at"),
        })
    }
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Job {
    let job_type = match row.get::<String, _>("job_type").as_str() {
        "crawl" => JobType::Crawl,
        "index" => JobType::Index,
        _ => JobType::FileProcess,
    };
    let status = match row.get::<String, _>("status").as_str() {
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Queued,
    };
    Job {
        id: row.get("id"),
        job_type,
        status,
        payload: row.get("payload"),
        progress: row.get("progress"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}
