//! Core data model (spec §3), independent of the backing store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub kb_id: Uuid,
    pub url: String,
    pub title: String,
    pub content_markdown: String,
    pub content_hash: String,
    pub indexed_content_hash: Option<String>,
    pub http_status: Option<u16>,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub page_id: Uuid,
    pub kb_id: Uuid,
    pub chunk_index: i32,
    pub section_path: String,
    pub chunk_text: String,
    pub chunk_hash: String,
    pub token_count: i32,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub url: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobType {
    Crawl,
    Index,
    FileProcess,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Crawl => "crawl",
            JobType::Index => "index",
            JobType::FileProcess => "file_process",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub progress: serde_json::Value,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, job_type: JobType, payload: serde_json::Value) -> Self {
        Job {
            id,
            job_type,
            status: JobStatus::Queued,
            payload,
            progress: serde_json::json!({}),
            error: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.progress
            .get("_meta")
            .and_then(|m| m.get("attempts"))
            .and_then(|a| a.as_u64())
            .unwrap_or(0) as u32
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileItem {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileBatchStatus {
    Pending,
    Partial,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileBatch {
    pub id: Uuid,
    pub kb_id: Uuid,
    pub status: FileBatchStatus,
    pub results: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractInfo {
    pub address: String,
    pub protocol: Option<String>,
    pub protocol_version: Option<String>,
    pub contract_type: Option<String>,
    pub contract_name: Option<String>,
    pub source_url: Option<String>,
    pub confidence: f64,
    pub chain_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub conversation_id: String,
    pub message_id: String,
    pub rating: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
    pub sources: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A chunk candidate plus its retrieval score, as returned from a `Store`
/// vector/lexical search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub kb_id: Uuid,
    pub url: String,
    pub title: String,
    pub section_path: String,
    pub text: String,
    pub score: f64,
}

/// Per-knowledge-base retrieval budget (spec §4.4).
#[derive(Clone, Copy, Debug)]
pub struct KbAllocation {
    pub kb_id: Uuid,
    pub top_k: usize,
}
