//! RAG orchestration (`prepare` → `answer`), tying together compaction,
//! retrieval, contract-address awareness, reranking, prompt assembly, and
//! answer framing. Grounded in
//! `original_source/.../rag/pipeline.py` (`prepare_rag`, `answer_with_rag`).

use crate::chat::{ChatCompletionRequest, ChatCompletionResult, ChatMessage, ChatProvider};
use crate::config::Config;
use crate::contracts;
use crate::conversation::{self, CompactionResult};
use crate::embedding::EmbeddingBackend;
use crate::error::AppResult;
use crate::rerank::{rerank_or_fallback, Reranker};
use crate::retrieval;
use crate::store::types::{ContractInfo, KbAllocation, RetrievedChunk};
use crate::store::Store;

use super::framer;
use super::prompt::{self, PromptInputs, SourceItem};

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)0x[a-f0-9]{40}").unwrap());

fn extract_addresses(text: &str) -> HashSet<String> {
    ADDRESS_RE.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

/// Keeps only chunks mentioning one of `addresses` when `strict`; otherwise
/// moves matching chunks to the front without dropping the rest.
fn filter_chunks_by_address(chunks: Vec<RetrievedChunk>, addresses: &HashSet<String>, strict: bool) -> Vec<RetrievedChunk> {
    if addresses.is_empty() {
        return chunks;
    }
    let (matched, unmatched): (Vec<_>, Vec<_>) = chunks.into_iter().partition(|c| {
        let chunk_addrs = extract_addresses(&c.text);
        chunk_addrs.iter().any(|a| addresses.contains(a))
    });
    if strict {
        matched
    } else {
        matched.into_iter().chain(unmatched).collect()
    }
}

pub struct RagPrepared {
    pub messages: Option<Vec<ChatMessage>>,
    pub sources: Vec<SourceItem>,
    pub direct_answer: Option<String>,
    pub contract_info: Option<ContractInfo>,
    pub retrieval_query: String,
    pub used_compaction: bool,
}

pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<SourceItem>,
    pub usage: crate::chat::ChatUsage,
    pub contract_info: Option<ContractInfo>,
    pub retrieval_query: String,
}

pub struct PrepareRequest<'a> {
    pub request_messages: &'a [ChatMessage],
    pub question: &'a str,
    pub address_lookup: Option<&'a str>,
    pub allocations: &'a [KbAllocation],
    pub requested_model: Option<&'a str>,
    pub strict_kb: bool,
}

/// Retrieval → address-aware filtering → contract lookup → rerank →
/// context/prompt assembly (spec §4.4–§4.9).
pub async fn prepare(
    store: &dyn Store,
    embeddings: &dyn EmbeddingBackend,
    chat: Option<&dyn ChatProvider>,
    reranker: Option<&dyn Reranker>,
    config: &Config,
    chat_model: &str,
    req: &PrepareRequest<'_>,
) -> AppResult<RagPrepared> {
    let (default_system_model, no_sources_answer) = prompt::resolve_default_prompts(req.requested_model);
    let _ = default_system_model;

    let system_instructions = conversation::extract_system_instructions(req.request_messages);
    let mut history_messages = req.request_messages.to_vec();
    if let Some(pos) = history_messages.iter().rposition(|m| m.role == "user") {
        history_messages.remove(pos);
    }
    let history_excerpt = conversation::format_history_excerpt(
        &history_messages,
        config.compaction.max_history_messages,
        config.compaction.max_history_chars,
        config.compaction.per_message_max_chars,
    );

    let mut retrieval_query = req.question.to_string();
    let mut memory_summary: Option<String> = None;
    let mut used_compaction = false;
    if let Some(chat) = chat {
        if config.compaction.query_rewrite_enabled || config.compaction.memory_summary_enabled {
            let CompactionResult { retrieval_query: rq, memory_summary: ms, used_llm } =
                conversation::compact_conversation(&config.compaction, chat, chat_model, req.request_messages, req.question).await;
            retrieval_query = rq;
            memory_summary = ms;
            used_compaction = used_llm;
        }
    }

    let allocations: Vec<KbAllocation> = req.allocations.iter().filter(|a| a.top_k > 0).copied().collect();
    if req.strict_kb && allocations.is_empty() {
        return Ok(RagPrepared {
            messages: None,
            sources: Vec::new(),
            direct_answer: Some(no_sources_answer.to_string()),
            contract_info: None,
            retrieval_query,
            used_compaction,
        });
    }

    let mut contract_info: Option<ContractInfo> = None;
    if let Some(address) = req.address_lookup {
        if contracts::is_valid_address(address) {
            contract_info = store.get_contract_info(&address.to_lowercase()).await?;
        }
    }

    let mut retrieved = retrieval::retrieve(store, embeddings, &config.retrieval, &allocations, &retrieval_query, config.retrieval.top_k).await?;

    let mut query_addresses = extract_addresses(req.question);
    if let Some(address) = req.address_lookup {
        if contracts::is_valid_address(address) {
            query_addresses.insert(address.to_lowercase());
        }
    }

    if !query_addresses.is_empty() {
        let strict_filtered = filter_chunks_by_address(retrieved.clone(), &query_addresses, true);
        if !strict_filtered.is_empty() {
            for address in &query_addresses {
                if contract_info.as_ref().map(|c| &c.address) == Some(address) {
                    continue;
                }
                if store.get_contract_info(address).await?.is_some() {
                    continue;
                }
                for chunk in strict_filtered.iter().take(3) {
                    if !chunk.text.to_lowercase().contains(address.as_str()) {
                        continue;
                    }
                    let info = contracts::build_contract_info_from_chunk(address, &chunk.text, &chunk.url);
                    if info.protocol.is_some() || info.contract_type.is_some() {
                        store.upsert_contract_info(info).await?;
                    }
                    break;
                }
            }
            retrieved = strict_filtered;
        } else {
            retrieved = filter_chunks_by_address(retrieved, &query_addresses, false);
        }
    }

    let max_ctx = if config.answer.inline_citations_enabled {
        config.retrieval.top_n.min(config.answer.max_sources)
    } else {
        config.retrieval.top_n
    };
    let ranked = rerank_or_fallback(reranker, &retrieval_query, retrieved, max_ctx).await;

    if ranked.is_empty() {
        return Ok(RagPrepared {
            messages: None,
            sources: Vec::new(),
            direct_answer: Some(no_sources_answer.to_string()),
            contract_info,
            retrieval_query,
            used_compaction,
        });
    }

    let sources = if config.answer.inline_citations_enabled {
        prompt::build_inline_sources(&ranked, config.answer.snippet_max_chars, max_ctx)
    } else {
        let mut sources = prompt::build_sources(&ranked, config.answer.max_sources);
        prompt::fill_source_snippets(&mut sources, &ranked, config.answer.snippet_max_chars);
        sources
    };

    let prompt_inputs = PromptInputs {
        system_instructions: &system_instructions,
        memory_summary: memory_summary.as_deref(),
        history_excerpt: &history_excerpt,
        question: req.question,
        requested_model: req.requested_model,
        inline_citations_enabled: config.answer.inline_citations_enabled,
        context_max_chars: config.answer.context_max_chars,
    };
    let messages = prompt::assemble_prompt(&ranked, &prompt_inputs);

    Ok(RagPrepared { messages: Some(messages), sources, direct_answer: None, contract_info, retrieval_query, used_compaction })
}

/// Runs `prepare` then, unless a direct (no-sources) answer short-circuits
/// it, calls the chat provider and frames the response (spec §4.10).
pub async fn answer(
    store: &dyn Store,
    embeddings: &dyn EmbeddingBackend,
    chat: Option<&dyn ChatProvider>,
    reranker: Option<&dyn Reranker>,
    config: &Config,
    chat_model: &str,
    req: &PrepareRequest<'_>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    json_mode: bool,
) -> AppResult<RagAnswer> {
    let (_, no_sources_answer) = prompt::resolve_default_prompts(req.requested_model);
    let prepared = prepare(store, embeddings, chat, reranker, config, chat_model, req).await?;

    if let Some(direct) = prepared.direct_answer {
        return Ok(RagAnswer {
            answer: direct,
            sources: prepared.sources,
            usage: Default::default(),
            contract_info: prepared.contract_info,
            retrieval_query: prepared.retrieval_query,
        });
    }

    let Some(messages) = prepared.messages else {
        return Ok(RagAnswer {
            answer: no_sources_answer.to_string(),
            sources: Vec::new(),
            usage: Default::default(),
            contract_info: prepared.contract_info,
            retrieval_query: prepared.retrieval_query,
        });
    };

    let Some(chat) = chat else {
        return Ok(RagAnswer {
            answer: no_sources_answer.to_string(),
            sources: prepared.sources,
            usage: Default::default(),
            contract_info: prepared.contract_info,
            retrieval_query: prepared.retrieval_query,
        });
    };

    let ChatCompletionResult { content, usage } = chat
        .complete(ChatCompletionRequest { model: chat_model.to_string(), messages, temperature, top_p, max_tokens, json_mode })
        .await?;

    let framed = framer::frame_answer(&content, json_mode, config.answer.inline_citations_enabled, config.answer.append_sources, &prepared.sources);

    Ok(RagAnswer { answer: framed, sources: prepared.sources, usage, contract_info: prepared.contract_info, retrieval_query: prepared.retrieval_query })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_chunks_by_address_strict_keeps_only_matches() {
        let chunks = vec![
            RetrievedChunk { chunk_id: uuid::Uuid::new_v4(), kb_id: uuid::Uuid::new_v4(), url: "u".into(), title: "t".into(), section_path: "s".into(), text: "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd".into(), score: 1.0 },
            RetrievedChunk { chunk_id: uuid::Uuid::new_v4(), kb_id: uuid::Uuid::new_v4(), url: "u".into(), title: "t".into(), section_path: "s".into(), text: "no address here".into(), score: 2.0 },
        ];
        let mut addresses = HashSet::new();
        addresses.insert("0xabcdefabcdefabcdefabcdefabcdefabcdefabcd".to_string());
        let filtered = filter_chunks_by_address(chunks, &addresses, true);
        assert_eq!(filtered.len(), 1);
    }
}
