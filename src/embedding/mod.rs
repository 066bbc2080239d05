//! Embedding adapters (spec §4.3). A uniform interface over four backends,
//! grounded in `original_source/onekey_rag_service/rag/embeddings.py`:
//! a deterministic hash fallback (`FakeEmbeddings`), a local sentence model,
//! and two remote HTTP backends (OpenAI-compatible, Ollama).

use crate::config::{EmbeddingConfig, EmbeddingsProvider};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>> {
        let mut docs = self.embed_documents(&[text.to_string()]).await?;
        docs.pop().ok_or_else(|| AppError::DependencyLogic("embedding backend returned no vector".into()))
    }

    fn dim(&self) -> usize;
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Deterministic sha256-digest-derived embedding. Never fails, never
/// depends on a network call — the fallback of last resort, grounded in
/// `embeddings.py::FakeEmbeddings`.
pub struct FakeEmbeddings {
    dim: usize,
}

impl FakeEmbeddings {
    pub fn new(dim: usize) -> Self {
        FakeEmbeddings { dim }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;
        while out.len() < self.dim {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest {
                if out.len() >= self.dim {
                    break;
                }
                // Map a byte to roughly [-1, 1].
                out.push((byte as f32 / 127.5) - 1.0);
            }
            counter += 1;
        }
        l2_normalize(&mut out);
        out
    }
}

#[async_trait]
impl EmbeddingBackend for FakeEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Remote OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiCompatibleEmbeddings {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dim: usize,
}

impl OpenAiCompatibleEmbeddings {
    pub fn new(base_url: String, api_key: Option<String>, model: String, dim: usize) -> Self {
        OpenAiCompatibleEmbeddings { client: reqwest::Client::new(), base_url, api_key, model, dim }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiCompatibleEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "model": self.model, "input": texts }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("embeddings request: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::DependencyLogic(format!("embeddings response parse: {e}")))?;
        if !status.is_success() {
            return Err(AppError::DependencyLogic(format!("embeddings endpoint returned {status}: {body}")));
        }
        let data = body
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| AppError::DependencyLogic("embeddings response missing data[]".into()))?;
        data.iter()
            .map(|row| {
                row.get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                    .ok_or_else(|| AppError::DependencyLogic("embeddings row missing embedding[]".into()))
            })
            .collect()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Remote Ollama embeddings. Tries the batch `/api/embed` endpoint first,
/// falling back to per-text `/api/embeddings` for older Ollama servers —
/// mirrors `embeddings.py::OllamaEmbeddings`.
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dim: usize,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String, dim: usize) -> Self {
        OllamaEmbeddings { client: reqwest::Client::new(), base_url, model, dim }
    }

    async fn embed_one_legacy(&self, text: &str) -> AppResult<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("ollama embeddings request: {e}")))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::DependencyLogic(format!("ollama embeddings parse: {e}")))?;
        body.get("embedding")
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
            .ok_or_else(|| AppError::DependencyLogic("ollama embeddings response missing embedding[]".into()))
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let batch_resp = self
            .client
            .post(format!("{}/api/embed", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await;

        if let Ok(resp) = batch_resp {
            if resp.status().is_success() {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    if let Some(embeddings) = body.get("embeddings").and_then(|e| e.as_array()) {
                        return Ok(embeddings
                            .iter()
                            .map(|row| {
                                row.as_array()
                                    .map(|arr| arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                                    .unwrap_or_default()
                            })
                            .collect());
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_one_legacy(text).await?);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(feature = "local-embeddings")]
pub struct LocalSentenceEmbeddings {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    dim: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalSentenceEmbeddings {
    pub fn new(dim: usize) -> AppResult<Self> {
        let model = fastembed::TextEmbedding::try_new(Default::default())
            .map_err(|e| AppError::DependencyUnavailable(format!("local embedding model init: {e}")))?;
        Ok(LocalSentenceEmbeddings { model: std::sync::Mutex::new(model), dim })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingBackend for LocalSentenceEmbeddings {
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let dim = self.dim;
        // fastembed's inference is synchronous CPU work; run it off the
        // async executor via `block_in_place` so it doesn't starve other
        // tasks sharing this worker thread.
        tokio::task::block_in_place(|| {
            let mut model = self
                .model
                .lock()
                .map_err(|_| AppError::WorkerPoison("local embedding model mutex poisoned".into()))?;
            let embeddings = model
                .embed(texts, None)
                .map_err(|e| AppError::DependencyLogic(format!("local embedding inference: {e}")))?;
            Ok(embeddings
                .into_iter()
                .map(|mut e| {
                    e.resize(dim, 0.0);
                    e
                })
                .collect())
        })
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Builds the configured embedding backend, dispatching on
/// `EMBEDDINGS_PROVIDER` the way `embeddings.py::build_embeddings_provider`
/// does.
pub fn build_embedding_backend(config: &EmbeddingConfig) -> AppResult<Box<dyn EmbeddingBackend>> {
    match config.provider {
        EmbeddingsProvider::Fake => Ok(Box::new(FakeEmbeddings::new(config.dim))),
        EmbeddingsProvider::OpenAiCompatible => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| AppError::Validation("EMBEDDINGS_BASE_URL required for openai_compatible provider".into()))?;
            let model = config.model.clone().unwrap_or_else(|| "text-embedding-3-small".to_string());
            Ok(Box::new(OpenAiCompatibleEmbeddings::new(base_url, config.api_key.clone(), model, config.dim)))
        }
        EmbeddingsProvider::Ollama => {
            let base_url = config.base_url.clone().unwrap_or_else(|| "http://localhost:11434".to_string());
            let model = config.model.clone().unwrap_or_else(|| "nomic-embed-text".to_string());
            Ok(Box::new(OllamaEmbeddings::new(base_url, model, config.dim)))
        }
        EmbeddingsProvider::SentenceTransformers => {
            #[cfg(feature = "local-embeddings")]
            {
                Ok(Box::new(LocalSentenceEmbeddings::new(config.dim)?))
            }
            #[cfg(not(feature = "local-embeddings"))]
            {
                Err(AppError::DependencyUnavailable(
                    "sentence_transformers provider requires the local-embeddings feature".into(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_embeddings_are_deterministic_and_normalized() {
        let backend = FakeEmbeddings::new(16);
        let a = backend.embed_query("hello").await.unwrap();
        let b = backend.embed_query("hello").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn fake_embeddings_differ_for_different_text() {
        let backend = FakeEmbeddings::new(16);
        let a = backend.embed_query("hello").await.unwrap();
        let b = backend.embed_query("goodbye").await.unwrap();
        assert_ne!(a, b);
    }
}
