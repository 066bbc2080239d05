//! Process configuration: environment-driven settings plus the handful of
//! CLI overrides for process-level knobs (port, data dir). Mirrors
//! `onekey_rag_service.config.Settings` field-for-field.

use std::env;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RetrievalMode {
    Vector,
    Hybrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingsProvider {
    Fake,
    SentenceTransformers,
    Ollama,
    OpenAiCompatible,
}

impl EmbeddingsProvider {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "sentence_transformers" | "sentence-transformers" => EmbeddingsProvider::SentenceTransformers,
            "ollama" => EmbeddingsProvider::Ollama,
            "openai_compatible" | "openai" => EmbeddingsProvider::OpenAiCompatible,
            _ => EmbeddingsProvider::Fake,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RerankProvider {
    None,
    CrossEncoder,
}

impl RerankProvider {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "none" | "off" | "false" | "0" | "" => RerankProvider::None,
            _ => RerankProvider::CrossEncoder,
        }
    }
}

/// Chunking tuning knobs (spec §4.1).
#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

/// Retrieval tuning knobs (spec §4.4).
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub top_n: usize,
    pub hybrid_vector_k: usize,
    pub hybrid_bm25_k: usize,
    pub hybrid_vector_weight: f64,
    pub hybrid_bm25_weight: f64,
    pub bm25_fts_config: String,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingsProvider,
    pub dim: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RerankConfig {
    pub provider: RerankProvider,
    pub max_candidates: usize,
    pub base_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub model_passthrough: bool,
}

#[derive(Clone, Debug)]
pub struct CompactionConfig {
    pub query_rewrite_enabled: bool,
    pub memory_summary_enabled: bool,
    pub max_history_messages: usize,
    pub max_history_chars: usize,
    pub per_message_max_chars: usize,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub max_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct AnswerConfig {
    pub inline_citations_enabled: bool,
    pub append_sources: bool,
    pub context_max_chars: usize,
    pub max_sources: usize,
    pub snippet_max_chars: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub chat: ChatConfig,
    pub compaction: CompactionConfig,
    pub worker: WorkerConfig,
    pub answer: AnswerConfig,
    pub total_timeout: Duration,
    pub prepare_timeout: Duration,
    pub max_concurrent_chat_requests: usize,
}

impl Config {
    /// Build configuration from environment variables, with CLI-supplied
    /// overrides for `port`/`data_dir` taking precedence.
    pub fn from_env(port_override: Option<u16>, data_dir_override: Option<String>) -> Self {
        let port = port_override.unwrap_or_else(|| env_parse("PORT", 8080));
        let data_dir = data_dir_override.unwrap_or_else(|| env_string("DATA_DIR", "./data"));

        Config {
            port,
            data_dir,
            chunking: ChunkingConfig {
                max_chars: env_parse("CHUNK_MAX_CHARS", 2400),
                overlap_chars: env_parse("CHUNK_OVERLAP_CHARS", 200),
            },
            retrieval: RetrievalConfig {
                mode: match env_string("RETRIEVAL_MODE", "hybrid").to_lowercase().as_str() {
                    "vector" => RetrievalMode::Vector,
                    _ => RetrievalMode::Hybrid,
                },
                top_k: env_parse("RAG_TOP_K", 40),
                top_n: env_parse("RAG_TOP_N", 8),
                hybrid_vector_k: env_parse("HYBRID_VECTOR_K", 30),
                hybrid_bm25_k: env_parse("HYBRID_BM25_K", 30),
                hybrid_vector_weight: env_parse("HYBRID_VECTOR_WEIGHT", 0.6),
                hybrid_bm25_weight: env_parse("HYBRID_BM25_WEIGHT", 0.4),
                bm25_fts_config: env_string("BM25_FTS_CONFIG", "simple"),
            },
            embedding: EmbeddingConfig {
                provider: EmbeddingsProvider::parse(&env_string("EMBEDDINGS_PROVIDER", "fake")),
                dim: env_parse("PGVECTOR_EMBEDDING_DIM", 1536),
                base_url: env::var("EMBEDDINGS_BASE_URL").ok(),
                api_key: env::var("EMBEDDINGS_API_KEY").ok(),
                model: env::var("EMBEDDINGS_MODEL").ok(),
            },
            rerank: RerankConfig {
                provider: RerankProvider::parse(&env_string("RERANK_PROVIDER", "none")),
                max_candidates: env_parse("RERANK_MAX_CANDIDATES", 30),
                base_url: env::var("RERANK_BASE_URL").ok(),
            },
            chat: ChatConfig {
                base_url: env_string("CHAT_BASE_URL", "http://localhost:11434/v1"),
                api_key: env::var("CHAT_API_KEY").ok(),
                model: env_string("CHAT_MODEL", "onekey-docs"),
                model_passthrough: env_bool("CHAT_MODEL_PASSTHROUGH", false),
            },
            compaction: CompactionConfig {
                query_rewrite_enabled: env_bool("QUERY_REWRITE_ENABLED", true),
                memory_summary_enabled: env_bool("MEMORY_SUMMARY_ENABLED", true),
                max_history_messages: env_parse("CONVERSATION_MAX_HISTORY_MESSAGES", 12),
                max_history_chars: env_parse("CONVERSATION_MAX_HISTORY_CHARS", 4000),
                per_message_max_chars: env_parse("CONVERSATION_PER_MESSAGE_MAX_CHARS", 800),
                max_tokens: env_parse("CONVERSATION_COMPACTION_MAX_TOKENS", 512),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_secs_f64(env_parse("WORKER_POLL_INTERVAL_S", 1.0)),
                stale_after: Duration::from_secs_f64(env_parse("WORKER_STALE_AFTER_S", 3600.0)),
                max_attempts: env_parse("WORKER_MAX_ATTEMPTS", 3),
            },
            answer: AnswerConfig {
                inline_citations_enabled: env_bool("INLINE_CITATIONS_ENABLED", true),
                append_sources: env_bool("ANSWER_APPEND_SOURCES", true),
                context_max_chars: env_parse("RAG_CONTEXT_MAX_CHARS", 12000),
                max_sources: env_parse("RAG_MAX_SOURCES", 8),
                snippet_max_chars: env_parse("RAG_SNIPPET_MAX_CHARS", 320),
            },
            total_timeout: Duration::from_secs_f64(env_parse("RAG_TOTAL_TIMEOUT_S", 60.0)),
            prepare_timeout: Duration::from_secs_f64(env_parse("RAG_PREPARE_TIMEOUT_S", 30.0)),
            max_concurrent_chat_requests: env_parse("MAX_CONCURRENT_CHAT_REQUESTS", 8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        let cfg = Config::from_env(Some(9090), Some("./x".into()));
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.data_dir, "./x");
        assert_eq!(cfg.chunking.max_chars, 2400);
        assert_eq!(cfg.retrieval.mode, RetrievalMode::Hybrid);
    }

    #[test]
    fn embeddings_provider_parses_known_variants() {
        assert_eq!(EmbeddingsProvider::parse("ollama"), EmbeddingsProvider::Ollama);
        assert_eq!(EmbeddingsProvider::parse("nonsense"), EmbeddingsProvider::Fake);
    }
}
