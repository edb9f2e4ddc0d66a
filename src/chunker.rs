//! LLM-driven semantic chunking.
//!
//! Instead of fixed-size splitting, the document text is handed to a chat
//! model window by window, and the model proposes variable-length,
//! semantically coherent chunks (respecting headings, lists, repeated
//! "cards"). The pipeline is:
//!
//! 1. Build token-budgeted windows over the extracted pages, each window
//!    carrying an overlap tail from its predecessor so chunk boundaries can
//!    cross window joins.
//! 2. Ask the model for a JSON array of chunk objects per window. The
//!    carried-over prefix is marked as context-only; chunks that end inside
//!    it are dropped as duplicates of the previous window's output.
//! 3. Map each chunk back to absolute character offsets: trust the model's
//!    offsets when they reproduce the chunk text, otherwise locate the text
//!    inside the window, otherwise skip the chunk.
//! 4. De-duplicate across windows by span overlap (> 80% of the shorter
//!    span collides; the earlier chunk wins).
//! 5. Attach page numbers from the page-offset table.
//!
//! A document whose every window fails, or that yields zero chunks overall,
//! fails ingestion; there is deliberately no fallback splitter.

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ServiceError;
use crate::extract::{PageMap, PageText, PAGE_SEPARATOR};
use crate::llm::ChatModel;
use crate::models::Chunk;
use crate::scope::ScopeKey;

/// Approximate chars-per-token ratio used for window budgeting.
const CHARS_PER_TOKEN: usize = 4;

/// Spans whose intersection exceeds this fraction of the shorter span are
/// considered the same chunk.
const DEDUP_OVERLAP: f64 = 0.8;

const CHUNKER_SYSTEM_PROMPT: &str = r#"You split a single document into variable-length, semantically coherent chunks for a retrieval index.

Return ONLY a JSON array of chunk objects. No prose, no Markdown fences.

Each element must be an object with these keys:
  "section":        short machine-friendly section label (e.g. "introduction", "pricing_table")
  "title":          human-readable chunk title
  "text":           exact text copied from the document (never paraphrase, never invent)
  "summary":        1-3 sentences describing the chunk
  "why_this_chunk": one short sentence on why this boundary makes sense
Optionally include "start_char" and "end_char": character offsets of the chunk within the NEW portion of the supplied text.

Chunking rules:
- Respect headings, subheadings, lists, and repeated card/template structures.
- Prefer semantic completeness over uniform length; target roughly 200-600 tokens, hard maximum ~800.
- Never split inside a sentence or inside a list item.
- Text before the '=== NEW WINDOW START ===' marker is context from an already-chunked region: use it to understand the document, but do not emit chunks for it."#;

/// Chunker tunables, lifted from the global config.
#[derive(Debug, Clone)]
pub struct ChunkerParams {
    pub window_tokens: usize,
    pub overlap_tokens: usize,
    pub llm_max_tokens: u32,
}

impl ChunkerParams {
    pub fn from_config(config: &Config) -> Self {
        ChunkerParams {
            window_tokens: config.chunker_window_tokens,
            overlap_tokens: config.chunker_overlap_tokens,
            llm_max_tokens: config.chunker_llm_max_tokens,
        }
    }
}

/// A token-budgeted slice of the document handed to the model in one call.
#[derive(Debug, Clone)]
pub struct Window {
    pub text: String,
    /// Offset of this window's first character in the full document text.
    pub abs_start: usize,
    /// Offset within `text` where new (not yet chunked) content begins.
    pub new_start: usize,
    pub pages: Vec<u32>,
    pub token_count: usize,
}

fn approx_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Builds overlapping windows over the page sequence. Windows close at page
/// boundaries once the token budget is reached; the tail worth
/// `overlap_tokens` is replayed at the head of the next window.
pub fn make_windows(pages: &[PageText], window_tokens: usize, overlap_tokens: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut buffer_pages: Vec<u32> = Vec::new();
    let mut buffer_tokens = 0usize;
    // Absolute offset of the buffer's first character, and how much of the
    // buffer head is carried-over overlap.
    let mut abs_start = 0usize;
    let mut carried_chars = 0usize;

    for page in pages {
        buffer.push(page.text.clone());
        buffer_pages.push(page.page);
        buffer_tokens += approx_tokens(&page.text);

        if buffer_tokens >= window_tokens {
            let full = buffer.join(PAGE_SEPARATOR);
            let overlap_ratio = overlap_tokens as f64 / buffer_tokens.max(1) as f64;
            let overlap_chars = (full.len() as f64 * overlap_ratio) as usize;
            let mut tail_begin = full.len().saturating_sub(overlap_chars);
            while !full.is_char_boundary(tail_begin) {
                tail_begin += 1;
            }

            let tail = full[tail_begin..].to_string();
            let next_abs_start = abs_start + tail_begin;
            let tail_tokens = approx_tokens(&tail);
            let tail_page = *buffer_pages.last().unwrap_or(&page.page);

            windows.push(Window {
                text: full,
                abs_start,
                new_start: carried_chars,
                pages: buffer_pages.clone(),
                token_count: buffer_tokens,
            });

            carried_chars = tail.len();
            buffer = vec![tail];
            buffer_pages = vec![tail_page];
            buffer_tokens = tail_tokens;
            abs_start = next_abs_start;
        }
    }

    // Flush the remainder, unless it is nothing but already-seen overlap.
    if !buffer.is_empty() {
        let full = buffer.join(PAGE_SEPARATOR);
        if full.len() > carried_chars || windows.is_empty() {
            windows.push(Window {
                text: full,
                abs_start,
                new_start: carried_chars,
                pages: buffer_pages,
                token_count: buffer_tokens,
            });
        }
    }

    windows
}

/// Frames a window for the model, marking the carried-over prefix as
/// context that must not be re-chunked.
pub fn build_user_message(window: &Window) -> String {
    let context = &window.text[..window.new_start];
    let new_text = &window.text[window.new_start..];

    let mut lines = Vec::new();
    if context.is_empty() {
        lines.push(
            "There is no overlap from a previous window. Everything below is new content to chunk."
                .to_string(),
        );
    } else {
        lines.push(
            "The text before the marker '=== NEW WINDOW START ===' was already chunked in a \
             previous window. Use it only as context and do NOT create chunks from it."
                .to_string(),
        );
    }
    lines.push("\n=== DOCUMENT TEXT ===".to_string());
    if !context.is_empty() {
        lines.push(context.to_string());
    }
    lines.push("\n=== NEW WINDOW START ===".to_string());
    lines.push(new_text.to_string());
    lines.join("\n")
}

/// One chunk object as returned by the model. Unknown keys are ignored;
/// a missing or empty `text` invalidates the chunk.
#[derive(Debug, Deserialize)]
struct LlmChunk {
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    title: Option<String>,
    text: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    why_this_chunk: Option<String>,
    #[serde(default)]
    start_char: Option<usize>,
    #[serde(default)]
    end_char: Option<usize>,
}

fn parse_window_response(value: Value) -> Result<Vec<LlmChunk>, ServiceError> {
    if !value.is_array() {
        return Err(ServiceError::MalformedUpstream(
            "chunker response is not a JSON array".into(),
        ));
    }
    serde_json::from_value::<Vec<LlmChunk>>(value)
        .map_err(|e| ServiceError::MalformedUpstream(format!("chunk object shape: {}", e)))
}

/// Resolves a model-reported chunk to an absolute `[start, end)` span, or
/// `None` when the chunk text cannot be located.
fn resolve_span(
    raw: &LlmChunk,
    window: &Window,
    full_text: &str,
    search_cursor: &mut usize,
) -> Option<(usize, usize)> {
    // Model offsets are relative to the new portion of the window.
    if let (Some(s), Some(e)) = (raw.start_char, raw.end_char) {
        let base = window.abs_start + window.new_start;
        let (abs_s, abs_e) = (base + s, base + e);
        if abs_s < abs_e && abs_e <= full_text.len() && full_text.get(abs_s..abs_e) == Some(raw.text.as_str()) {
            *search_cursor = (abs_e - window.abs_start).min(window.text.len());
            return Some((abs_s, abs_e));
        }
    }

    // Fall back to locating the text inside the window, scanning forward
    // from the last match so repeated passages keep document order.
    let from = (*search_cursor).min(window.text.len());
    let found = window.text[from..]
        .find(&raw.text)
        .map(|idx| from + idx)
        .or_else(|| window.text.find(&raw.text))?;
    let abs_s = window.abs_start + found;
    let abs_e = abs_s + raw.text.len();
    *search_cursor = found + raw.text.len();
    Some((abs_s, abs_e))
}

fn spans_collide(a: (usize, usize), b: (usize, usize)) -> bool {
    let inter_start = a.0.max(b.0);
    let inter_end = a.1.min(b.1);
    if inter_end <= inter_start {
        return false;
    }
    let intersection = (inter_end - inter_start) as f64;
    let shorter = (a.1 - a.0).min(b.1 - b.0).max(1) as f64;
    intersection / shorter > DEDUP_OVERLAP
}

/// Runs the chunker over extracted pages. Individual window failures are
/// tolerated; a document that produces no chunks at all is an error.
pub async fn chunk_document(
    llm: &dyn ChatModel,
    params: &ChunkerParams,
    doc_id: Uuid,
    scope: &ScopeKey,
    pages: &[PageText],
) -> Result<Vec<Chunk>, ServiceError> {
    if pages.is_empty() {
        return Err(ServiceError::Validation(
            "document contains no extractable text".into(),
        ));
    }

    let (full_text, page_map) = PageMap::build(pages);
    let windows = make_windows(pages, params.window_tokens, params.overlap_tokens);
    let window_count = windows.len();

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut failed_windows = 0usize;

    for (idx, window) in windows.iter().enumerate() {
        tracing::info!(
            %doc_id,
            window = idx + 1,
            windows = window_count,
            tokens = window.token_count,
            "chunking window"
        );

        let user_message = build_user_message(window);
        let raw = match llm
            .complete_json(CHUNKER_SYSTEM_PROMPT, &user_message, params.llm_max_tokens)
            .await
            .and_then(parse_window_response)
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%doc_id, window = idx + 1, error = %e, "chunker window failed");
                failed_windows += 1;
                continue;
            }
        };

        let mut search_cursor = 0usize;
        for item in raw {
            if item.text.trim().is_empty() {
                continue;
            }
            let Some((start_char, end_char)) = resolve_span(&item, window, &full_text, &mut search_cursor)
            else {
                tracing::debug!(%doc_id, window = idx + 1, "chunk text not found in window, skipped");
                continue;
            };

            // Entirely inside the carried-over prefix: the previous window
            // already produced it.
            if end_char <= window.abs_start + window.new_start {
                continue;
            }

            let text = full_text[start_char..end_char].to_string();
            chunks.push(Chunk {
                chunk_id: Uuid::new_v4(),
                doc_id,
                scope: scope.clone(),
                start_char,
                end_char,
                pages: page_map.pages_for_span(start_char, end_char),
                title: item.title.unwrap_or_else(|| "Untitled".into()),
                section: item.section.unwrap_or_else(|| "unknown".into()),
                summary: item.summary.unwrap_or_default(),
                why_this_chunk: item.why_this_chunk.unwrap_or_default(),
                text,
            });
        }
    }

    let chunks = dedup_chunks(chunks);

    if chunks.is_empty() {
        if failed_windows == window_count {
            return Err(ServiceError::fatal(
                "chunker",
                "every chunking window failed; check LLM connectivity and output",
            ));
        }
        return Err(ServiceError::fatal(
            "chunker",
            "chunking produced 0 chunks; check LLM output and document text extraction",
        ));
    }

    tracing::info!(%doc_id, chunks = chunks.len(), windows = window_count, "chunking complete");
    Ok(chunks)
}

/// Removes near-duplicate spans produced by window overlap. Chunks are
/// compared in document order; the earlier of two colliding spans wins.
fn dedup_chunks(mut chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks.sort_by_key(|c| (c.start_char, c.end_char));

    let mut kept: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let span = (chunk.start_char, chunk.end_char);
        let duplicate = kept
            .iter()
            .rev()
            .take_while(|k| k.end_char > chunk.start_char)
            .any(|k| spans_collide((k.start_char, k.end_char), span));
        if !duplicate {
            kept.push(chunk);
        }
    }
    kept
}
