//! Contract-address index and RAG reverse lookup (spec §4.6, §4.7).
//! Grounded in
//! `original_source/onekey_rag_service/services/contract_index.py`.

use crate::error::AppResult;
use crate::store::types::{ContractInfo, RetrievedChunk};
use crate::store::Store;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)0x[a-f0-9]{40}").unwrap());

struct ProtocolPattern {
    needle: &'static str,
    protocol: &'static str,
}

const PROTOCOL_URL_PATTERNS: &[ProtocolPattern] = &[
    ProtocolPattern { needle: "docs.aave.com", protocol: "Aave" },
    ProtocolPattern { needle: "aave.com", protocol: "Aave" },
    ProtocolPattern { needle: "docs.uniswap.org", protocol: "Uniswap" },
    ProtocolPattern { needle: "uniswap.org", protocol: "Uniswap" },
    ProtocolPattern { needle: "compound.finance", protocol: "Compound" },
    ProtocolPattern { needle: "curve.fi", protocol: "Curve" },
    ProtocolPattern { needle: "lido.fi", protocol: "Lido" },
    ProtocolPattern { needle: "makerdao.com", protocol: "MakerDAO" },
    ProtocolPattern { needle: "balancer.fi", protocol: "Balancer" },
    ProtocolPattern { needle: "1inch.io", protocol: "1inch" },
    ProtocolPattern { needle: "sushi.com", protocol: "SushiSwap" },
    ProtocolPattern { needle: "yearn.fi", protocol: "Yearn" },
    ProtocolPattern { needle: "synthetix.io", protocol: "Synthetix" },
    ProtocolPattern { needle: "chain.link", protocol: "Chainlink" },
    ProtocolPattern { needle: "convexfinance.com", protocol: "Convex" },
    ProtocolPattern { needle: "frax.finance", protocol: "Frax" },
    ProtocolPattern { needle: "pendle.finance", protocol: "Pendle" },
    ProtocolPattern { needle: "gmx.io", protocol: "GMX" },
];

/// Extracts a protocol name from a source URL by lowercased substring
/// match against `PROTOCOL_URL_PATTERNS`, longest/most-specific needle
/// checked first so `docs.aave.com` wins over the bare `aave.com` entry.
pub fn extract_protocol_from_url(url: &str) -> Option<&'static str> {
    let lower = url.to_lowercase();
    let mut sorted: Vec<&ProtocolPattern> = PROTOCOL_URL_PATTERNS.iter().collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.needle.len()));
    sorted.iter().find(|p| lower.contains(p.needle)).map(|p| p.protocol)
}

static VERSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        RegexBuilder::new(r"\bV(\d+)\b").case_insensitive(true).build().unwrap(),
        Regex::new(r"\bv(\d+)\b").unwrap(),
        RegexBuilder::new(r"-v(\d+)").case_insensitive(true).build().unwrap(),
    ]
});

/// Extracts a protocol version (`V3`, `V2`, ...) from free text.
pub fn extract_version_from_text(text: &str) -> Option<String> {
    for pattern in VERSION_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            return Some(format!("V{}", &caps[1]));
        }
    }
    None
}

/// Four ordered line-pattern regexes for recovering a human-readable
/// contract name/type from the line(s) surrounding an address mention.
fn contract_type_patterns(addr_prefix: &str) -> Vec<Regex> {
    let escaped = regex::escape(addr_prefix);
    vec![
        Regex::new(&format!(r"\|\s*\[([^\]]+)\]\([^)]*\)\s*\|\s*\[0x")).unwrap(),
        RegexBuilder::new(&format!(r"\[([^\]]+)\]\([^)]*\).*?{escaped}"))
            .dot_matches_new_line(false)
            .build()
            .unwrap(),
        Regex::new(&format!(r"(\w+(?:\s+\w+)?)\s*:\s*{escaped}")).unwrap(),
        Regex::new(&format!(r"(\w+(?:\s+\w+)?)\s*\({escaped}")).unwrap(),
    ]
}

/// Extracts a contract type/name from the chunk text surrounding an
/// address, trying each line-pattern in priority order and returning the
/// first match (spec §4.6).
pub fn extract_contract_type_from_chunk(chunk_text: &str, address: &str) -> Option<String> {
    let addr_prefix: String = address.chars().take(10).collect();
    let patterns = contract_type_patterns(&addr_prefix);

    for line in chunk_text.lines() {
        if !line.to_lowercase().contains(&addr_prefix.to_lowercase()) {
            continue;
        }
        for pattern in &patterns {
            if let Some(caps) = pattern.captures(line) {
                return Some(caps[1].trim().to_string());
            }
        }
    }
    None
}

/// Finds every address mentioned in a chunk, lowercased and deduplicated.
pub fn extract_addresses_from_chunk(chunk_text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in ADDRESS_RE.find_iter(chunk_text) {
        let addr = m.as_str().to_lowercase();
        if seen.insert(addr.clone()) {
            out.push(addr);
        }
    }
    out
}

/// Builds a `ContractInfo` candidate from a chunk mentioning `address`,
/// with confidence 0.9 when a contract type was recovered, else 0.7 —
/// matching `contract_index.py::build_contract_info_from_chunk`.
pub fn build_contract_info_from_chunk(address: &str, chunk_text: &str, url: &str) -> ContractInfo {
    let contract_type = extract_contract_type_from_chunk(chunk_text, address);
    let protocol = extract_protocol_from_url(url).map(|s| s.to_string());
    let protocol_version = extract_version_from_text(chunk_text);
    let confidence = if contract_type.is_some() { 0.9 } else { 0.7 };

    ContractInfo {
        address: address.to_lowercase(),
        protocol,
        protocol_version,
        contract_name: contract_type.clone(),
        contract_type,
        source_url: Some(url.to_string()),
        confidence,
        chain_id: 1,
        updated_at: Utc::now(),
    }
}

const ADDRESS_RE_STR: &str = r"(?i)^0x[a-f0-9]{40}$";

pub fn is_valid_address(address: &str) -> bool {
    Regex::new(ADDRESS_RE_STR).unwrap().is_match(address)
}

/// Reverse lookup: find chunks that mention `address` and derive contract
/// info from the first chunk that yields a confident match, optionally
/// upserting it into the index (spec §4.7). Returns `None` on a total miss.
pub async fn rag_reverse_lookup(store: &dyn Store, address: &str, auto_learn: bool) -> AppResult<Option<ContractInfo>> {
    let hits: Vec<RetrievedChunk> = store.find_chunks_containing(address, 5).await?;
    for hit in hits {
        let candidate = build_contract_info_from_chunk(address, &hit.text, &hit.url);
        if candidate.protocol.is_some() || candidate.contract_type.is_some() {
            if auto_learn {
                return Ok(Some(store.upsert_contract_info(candidate).await?));
            }
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BuildIndexStats {
    pub scanned: usize,
    pub addresses_found: usize,
    pub indexed: usize,
    pub skipped_existing: usize,
    pub protocols: std::collections::HashMap<String, usize>,
}

/// Paginated scan of a knowledge base's chunks for contract addresses,
/// upserting any newly-discovered addresses into the index. Mirrors
/// `contract_index.py::batch_build_contract_index`.
pub async fn batch_build_contract_index(
    store: &dyn Store,
    kb_id: uuid::Uuid,
    batch_size: usize,
    dry_run: bool,
) -> AppResult<BuildIndexStats> {
    let mut stats = BuildIndexStats::default();
    let mut offset = 0usize;

    loop {
        let batch = store.scan_chunks_with_addresses(kb_id, offset, batch_size).await?;
        if batch.is_empty() {
            break;
        }
        for chunk in &batch {
            stats.scanned += 1;
            for address in extract_addresses_from_chunk(&chunk.text) {
                stats.addresses_found += 1;
                if store.get_contract_info(&address).await?.is_some() {
                    stats.skipped_existing += 1;
                    continue;
                }
                let info = build_contract_info_from_chunk(&address, &chunk.text, &chunk.url);
                if let Some(protocol) = &info.protocol {
                    *stats.protocols.entry(protocol.clone()).or_insert(0) += 1;
                }
                if !dry_run {
                    store.upsert_contract_info(info).await?;
                }
                stats.indexed += 1;
            }
        }
        offset += batch.len();
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_protocol_from_url_prefers_more_specific_subdomain() {
        assert_eq!(extract_protocol_from_url("https://docs.aave.com/v3"), Some("Aave"));
        assert_eq!(extract_protocol_from_url("https://aave.com/governance"), Some("Aave"));
        assert_eq!(extract_protocol_from_url("https://example.com"), None);
    }

    #[test]
    fn extract_version_from_text_matches_v_prefixed_number() {
        assert_eq!(extract_version_from_text("Aave V3 Pool"), Some("V3".to_string()));
        assert_eq!(extract_version_from_text("uniswap-v2 router"), Some("V2".to_string()));
        assert_eq!(extract_version_from_text("no version here"), None);
    }

    #[test]
    fn extract_contract_type_from_chunk_reads_markdown_table_row() {
        let text = "| [Pool](https://docs.aave.com/pool) | [0xabcdefabcdefabcdefabcdefabcdefabcdefabcd](...) |";
        let addr = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";
        assert_eq!(extract_contract_type_from_chunk(text, addr), Some("Pool".to_string()));
    }

    #[test]
    fn is_valid_address_requires_40_hex_chars() {
        assert!(is_valid_address("0xabcdefabcdefabcdefabcdefabcdefabcdefabcd"));
        assert!(!is_valid_address("0xshort"));
    }
}
