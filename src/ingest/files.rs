//! Uploaded-file text extraction dispatch (spec §3 FileBatch/FileItem,
//! §4.13 failure semantics). Grounded in
//! `original_source/onekey_rag_service/worker.py::_handle_file_process_job`'s
//! `_extract_text`: dispatch by extension, multi-encoding fallback for
//! plain text, page-join for PDF, paragraph-join for DOCX.

use crate::error::{AppError, AppResult};
use std::path::Path;

fn decode_best_effort(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    // utf-16 (only plausible alternative encoding worth trying without
    // pulling in a full charset-detection crate); otherwise fall back to
    // a lossy latin-1-ish byte-to-char mapping, matching the spirit of the
    // original's `("utf-8", "utf-16", "latin-1")` attempt order.
    if bytes.len() % 2 == 0 {
        let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        if let Ok(s) = String::from_utf16(&units) {
            return s;
        }
    }
    bytes.iter().map(|&b| b as char).collect()
}

/// Extracts plain text from an uploaded file by dispatching on its
/// extension. Returns `Err(AppError::Validation)` for unsupported types,
/// matching the original's "unsupported file type" exception, which the
/// worker treats as a per-item failure rather than aborting the whole
/// batch.
pub fn extract_text(filename: &str, bytes: &[u8]) -> AppResult<String> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" | "markdown" | "csv" => Ok(decode_best_effort(bytes)),
        "html" | "htm" => {
            let raw = decode_best_effort(bytes);
            Ok(crate::ingest::extractor::extract_readable(&raw).markdown)
        }
        "pdf" => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AppError::DependencyLogic(format!("pdf extract {filename}: {e}"))),
        "docx" => extract_docx(bytes).map_err(|e| AppError::DependencyLogic(format!("docx extract {filename}: {e}"))),
        other => Err(AppError::Validation(format!("unsupported file type: .{other}"))),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, String> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| e.to_string())?;
    let json = docx.json();
    let parsed: serde_json::Value = serde_json::from_str(&json).map_err(|e| e.to_string())?;
    let mut paragraphs = Vec::new();
    if let Some(children) = parsed.pointer("/document/children").and_then(|v| v.as_array()) {
        for child in children {
            if let Some(runs) = child.pointer("/data/children").and_then(|v| v.as_array()) {
                let mut text = String::new();
                for run in runs {
                    if let Some(t) = run.pointer("/data/children/0/data/text").and_then(|v| v.as_str()) {
                        text.push_str(t);
                    }
                }
                if !text.is_empty() {
                    paragraphs.push(text);
                }
            }
        }
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_decodes_plain_utf8() {
        let text = extract_text("notes.txt", "hello world".as_bytes()).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn extract_text_rejects_unsupported_extension() {
        let err = extract_text("archive.zip", b"PK").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn decode_best_effort_does_not_panic_on_invalid_utf8() {
        let bytes = vec![0xff, 0xfe, 0x41, 0x00];
        let _ = decode_best_effort(&bytes);
    }
}
