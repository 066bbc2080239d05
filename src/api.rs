//! axum routes: chat completions (stream + non-stream), models, contracts
//! lookup/stats/build-index, feedback, admin crawl/index/job-status, health
//! (spec §6, SPEC_FULL §2). Grounded in
//! `original_source/src/onekey_rag_service/api/app.py` and
//! `original_source/onekey_rag_service/api/contracts.py`.

use crate::auth::{require_api_key, AuthConfig};
use crate::chat::{ChatMessage, ChatProvider};
use crate::config::Config;
use crate::contracts;
use crate::embedding::EmbeddingBackend;
use crate::error::{AppError, AppResult};
use crate::jobs::Worker;
use crate::rag::pipeline::{self, PrepareRequest};
use crate::rerank::Reranker;
use crate::store::types::{Feedback, Job, JobType, KbAllocation};
use crate::store::Store;
use crate::streaming;

use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub struct AppStateInner {
    pub store: Arc<dyn Store>,
    pub embeddings: Arc<dyn EmbeddingBackend>,
    pub chat: Option<Arc<dyn ChatProvider>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub worker: Arc<Worker>,
    pub config: Config,
    pub default_kb: Uuid,
    pub model_map: HashMap<String, String>,
    pub chat_semaphore: Arc<Semaphore>,
}

pub type AppState = Arc<AppStateInner>;

pub fn routes(state: AppState, auth: AuthConfig) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/feedback", post(feedback))
        .route("/api/v1/admin/crawl", post(admin_crawl))
        .route("/api/v1/admin/index", post(admin_index))
        .route("/api/v1/admin/jobs/:id", get(admin_job_status))
        .route("/api/v1/contracts/stats/protocols", get(contract_protocol_stats))
        .route("/api/v1/contracts/build-index", post(contract_build_index))
        .route("/api/v1/contracts/lookup", post(contract_lookup))
        .route("/api/v1/contracts/:address", get(contract_get))
        .layer(middleware::from_fn_with_state(auth, require_api_key));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/models", get(list_models))
        .merge(protected)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    dependencies: HashMap<String, String>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut dependencies = HashMap::new();
    dependencies.insert("store".to_string(), "ok".to_string());
    dependencies.insert(
        "chat".to_string(),
        if state.chat.is_some() { "configured".to_string() } else { "unconfigured".to_string() },
    );
    Json(HealthResponse { status: "ok", dependencies })
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: &'static str,
    root: String,
    parent: Option<String>,
    meta: ModelMeta,
}

#[derive(Serialize)]
struct ModelMeta {
    upstream_model: String,
    base_url: String,
}

#[derive(Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let data = state
        .model_map
        .iter()
        .map(|(exposed, upstream)| ModelEntry {
            id: exposed.clone(),
            object: "model",
            created,
            owned_by: "chainrag",
            root: exposed.clone(),
            parent: None,
            meta: ModelMeta { upstream_model: upstream.clone(), base_url: state.config.chat.base_url.clone() },
        })
        .collect();
    Json(ModelList { object: "list", data })
}

#[derive(Deserialize)]
struct ChatCompletionsBody {
    #[serde(default = "default_model")]
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    #[serde(default)]
    response_format: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    debug: bool,
}

fn default_model() -> String {
    "onekey-docs".to_string()
}

fn json_mode_requested(response_format: &Option<serde_json::Value>) -> bool {
    response_format
        .as_ref()
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
        .map(|t| t == "json_object")
        .unwrap_or(false)
}

fn resolve_upstream_model(state: &AppState, requested: &str) -> String {
    if let Some(upstream) = state.model_map.get(requested) {
        return upstream.clone();
    }
    if state.config.chat.model_passthrough {
        return requested.to_string();
    }
    state.config.chat.model.clone()
}

fn last_user_message(messages: &[ChatMessage]) -> AppResult<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| AppError::Validation("messages is missing a user turn".into()))
}

/// `POST /v1/chat/completions`: OpenAI-compatible, streaming and
/// non-streaming. A process-wide semaphore bounds concurrent upstream chat
/// calls (SPEC_FULL §2).
async fn chat_completions(State(state): State<AppState>, Json(body): Json<ChatCompletionsBody>) -> AppResult<axum::response::Response> {
    let question = last_user_message(&body.messages)?;
    let upstream_model = resolve_upstream_model(&state, &body.model);
    let json_mode = json_mode_requested(&body.response_format);
    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    let allocations = vec![KbAllocation { kb_id: state.default_kb, top_k: state.config.retrieval.top_k }];
    let req = PrepareRequest {
        request_messages: &body.messages,
        question: &question,
        address_lookup: None,
        allocations: &allocations,
        requested_model: Some(body.model.as_str()),
        strict_kb: false,
    };

    let _permit = state.chat_semaphore.acquire().await.map_err(|_| AppError::Other(anyhow::anyhow!("semaphore closed")))?;

    if !body.stream {
        let timeout = state.config.total_timeout;
        let answer = tokio::time::timeout(
            timeout,
            pipeline::answer(
                state.store.as_ref(),
                state.embeddings.as_ref(),
                state.chat.as_deref(),
                state.reranker.as_deref(),
                &state.config,
                &upstream_model,
                &req,
                body.temperature,
                body.top_p,
                body.max_tokens,
                json_mode,
            ),
        )
        .await
        .map_err(|_| AppError::Timeout("chat completion timed out".into()))??;

        let sources: Vec<serde_json::Value> = answer
            .sources
            .iter()
            .map(|s| serde_json::json!({"ref": s.ref_num, "url": s.url, "title": s.title, "section_path": s.section_path, "snippet": s.snippet}))
            .collect();

        let body = serde_json::json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": body.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": answer.answer},
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": answer.usage.prompt_tokens,
                "completion_tokens": answer.usage.completion_tokens,
                "total_tokens": answer.usage.total_tokens,
            },
            "sources": sources,
            "contract_info": answer.contract_info,
        });
        return Ok(Json(body).into_response());
    }

    let prepare_timeout = state.config.prepare_timeout;
    let prepared = tokio::time::timeout(
        prepare_timeout,
        pipeline::prepare(
            state.store.as_ref(),
            state.embeddings.as_ref(),
            state.chat.as_deref(),
            state.reranker.as_deref(),
            &state.config,
            &upstream_model,
            &req,
        ),
    )
    .await;

    let (messages, sources, direct_answer) = match prepared {
        Ok(Ok(p)) => (p.messages, p.sources, p.direct_answer),
        Ok(Err(e)) => return Err(e),
        Err(_) => (None, Vec::new(), Some("[error] preparing an answer timed out, please retry".to_string())),
    };

    let chat = match (&state.chat, &messages, &direct_answer) {
        (Some(chat), Some(_), None) => chat.clone(),
        _ => {
            let text = direct_answer.unwrap_or_else(|| "no chat provider configured".to_string());
            let frames = streaming::direct_answer_stream(id, body.model, created, text, sources);
            return Ok(Sse::new(frames).keep_alive(KeepAlive::default()).into_response());
        }
    };

    let chat_request = crate::chat::ChatCompletionRequest {
        model: upstream_model,
        messages: messages.unwrap(),
        temperature: body.temperature,
        top_p: body.top_p,
        max_tokens: body.max_tokens,
        json_mode,
    };

    let frames = streaming::stream_answer(chat, chat_request, id, body.model, created, sources);
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()).into_response())
}

#[derive(Deserialize)]
struct FeedbackBody {
    conversation_id: String,
    message_id: String,
    rating: String,
    reason: Option<String>,
    comment: Option<String>,
    sources: Option<Vec<String>>,
}

#[derive(Serialize)]
struct FeedbackResponse {
    status: &'static str,
}

async fn feedback(State(state): State<AppState>, Json(body): Json<FeedbackBody>) -> AppResult<Json<FeedbackResponse>> {
    if body.rating != "up" && body.rating != "down" {
        return Err(AppError::Validation("rating must be \"up\" or \"down\"".into()));
    }
    state
        .store
        .record_feedback(Feedback {
            id: Uuid::new_v4(),
            conversation_id: body.conversation_id,
            message_id: body.message_id,
            rating: body.rating,
            reason: body.reason,
            comment: body.comment,
            sources: serde_json::json!({ "urls": body.sources.unwrap_or_default() }),
            created_at: chrono::Utc::now(),
        })
        .await?;
    Ok(Json(FeedbackResponse { status: "ok" }))
}

#[derive(Deserialize)]
struct AdminCrawlBody {
    #[serde(default)]
    kb_id: Option<Uuid>,
    sitemap_url: Option<String>,
    #[serde(default)]
    seed_urls: Vec<String>,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    max_pages: Option<usize>,
}

#[derive(Serialize)]
struct AdminJobResponse {
    job_id: String,
}

async fn admin_crawl(State(state): State<AppState>, Json(body): Json<AdminCrawlBody>) -> AppResult<Json<AdminJobResponse>> {
    let kb_id = body.kb_id.unwrap_or(state.default_kb);
    let job_id = format!("crawl_{}", Uuid::new_v4().simple());
    let payload = serde_json::json!({
        "kb_id": kb_id.to_string(),
        "sitemap_url": body.sitemap_url,
        "seed_urls": body.seed_urls,
        "include_patterns": body.include_patterns,
        "exclude_patterns": body.exclude_patterns,
        "max_pages": body.max_pages,
    });
    state.store.enqueue_job(Job::new(job_id.clone(), JobType::Crawl, payload)).await?;
    Ok(Json(AdminJobResponse { job_id }))
}

#[derive(Deserialize)]
struct AdminIndexBody {
    #[serde(default)]
    kb_id: Option<Uuid>,
}

async fn admin_index(State(state): State<AppState>, Json(body): Json<AdminIndexBody>) -> AppResult<Json<AdminJobResponse>> {
    let kb_id = body.kb_id.unwrap_or(state.default_kb);
    let job_id = format!("index_{}", Uuid::new_v4().simple());
    let payload = serde_json::json!({ "kb_id": kb_id.to_string() });
    state.store.enqueue_job(Job::new(job_id.clone(), JobType::Index, payload)).await?;
    Ok(Json(AdminJobResponse { job_id }))
}

#[derive(Serialize)]
struct AdminJobStatusResponse {
    job_id: String,
    status: &'static str,
    progress: serde_json::Value,
    error: String,
}

async fn admin_job_status(State(state): State<AppState>, Path(job_id): Path<String>) -> AppResult<Json<AdminJobStatusResponse>> {
    let job = state.store.get_job(&job_id).await?.ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))?;
    Ok(Json(AdminJobStatusResponse {
        job_id: job.id,
        status: job.status.as_str(),
        progress: job.progress,
        error: job.error,
    }))
}

#[derive(Deserialize)]
struct ContractLookupQuery {
    #[serde(default = "default_true")]
    auto_learn: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct ContractInfoResponse {
    address: String,
    protocol: String,
    protocol_version: String,
    contract_type: String,
    contract_name: String,
    source_url: String,
    confidence: f64,
    chain_id: i64,
    source: &'static str,
}

impl ContractInfoResponse {
    fn from_info(info: crate::store::types::ContractInfo, source: &'static str) -> Self {
        ContractInfoResponse {
            address: info.address,
            protocol: info.protocol.unwrap_or_default(),
            protocol_version: info.protocol_version.unwrap_or_default(),
            contract_type: info.contract_type.unwrap_or_default(),
            contract_name: info.contract_name.unwrap_or_default(),
            source_url: info.source_url.unwrap_or_default(),
            confidence: info.confidence,
            chain_id: info.chain_id,
            source,
        }
    }
}

async fn contract_get(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<ContractLookupQuery>,
) -> AppResult<Json<ContractInfoResponse>> {
    let address_lower = address.to_lowercase();
    if !contracts::is_valid_address(&address_lower) {
        return Err(AppError::Validation("invalid contract address format".into()));
    }

    if let Some(info) = state.store.get_contract_info(&address_lower).await? {
        return Ok(Json(ContractInfoResponse::from_info(info, "index")));
    }

    if let Some(info) = contracts::rag_reverse_lookup(state.store.as_ref(), &address_lower, query.auto_learn).await? {
        return Ok(Json(ContractInfoResponse::from_info(info, "rag")));
    }

    Err(AppError::NotFound(format!("contract {address} not found in knowledge base")))
}

#[derive(Deserialize)]
struct ContractLookupBody {
    addresses: Vec<String>,
    #[serde(default = "default_true")]
    auto_learn: bool,
}

#[derive(Serialize)]
struct ContractLookupResponse {
    results: HashMap<String, Option<ContractInfoResponse>>,
    stats: HashMap<&'static str, i64>,
}

async fn contract_lookup(State(state): State<AppState>, Json(body): Json<ContractLookupBody>) -> AppResult<Json<ContractLookupResponse>> {
    let mut results = HashMap::new();
    let mut stats: HashMap<&'static str, i64> = HashMap::from([("total", 0), ("index_hits", 0), ("rag_hits", 0), ("not_found", 0)]);

    for address in &body.addresses {
        let address_lower = address.to_lowercase();
        if !contracts::is_valid_address(&address_lower) {
            results.insert(address.clone(), None);
            continue;
        }
        *stats.get_mut("total").unwrap() += 1;

        if let Some(info) = state.store.get_contract_info(&address_lower).await? {
            *stats.get_mut("index_hits").unwrap() += 1;
            results.insert(address.clone(), Some(ContractInfoResponse::from_info(info, "index")));
            continue;
        }

        match contracts::rag_reverse_lookup(state.store.as_ref(), &address_lower, body.auto_learn).await? {
            Some(info) => {
                *stats.get_mut("rag_hits").unwrap() += 1;
                results.insert(address.clone(), Some(ContractInfoResponse::from_info(info, "rag")));
            }
            None => {
                *stats.get_mut("not_found").unwrap() += 1;
                results.insert(address.clone(), None);
            }
        }
    }

    Ok(Json(ContractLookupResponse { results, stats }))
}

async fn contract_protocol_stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let rows = state.store.protocol_stats().await?;
    let total: i64 = rows.iter().map(|(_, count)| count).sum();
    let by_protocol: HashMap<String, i64> = rows.into_iter().collect();
    Ok(Json(serde_json::json!({ "total_contracts": total, "by_protocol": by_protocol })))
}

#[derive(Deserialize)]
struct BuildIndexBody {
    #[serde(default)]
    kb_id: Option<Uuid>,
    #[serde(default)]
    dry_run: bool,
}

async fn contract_build_index(State(state): State<AppState>, Json(body): Json<BuildIndexBody>) -> AppResult<Json<contracts::BuildIndexStats>> {
    let kb_id = body.kb_id.unwrap_or(state.default_kb);
    let stats = contracts::batch_build_contract_index(state.store.as_ref(), kb_id, 200, body.dry_run).await?;
    Ok(Json(stats))
}

