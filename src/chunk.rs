//! Sliding-window text chunker.
//!
//! Splits normalized document text into [`Chunk`]s of at most `max_chars`
//! characters. Each chunk owns a contiguous span of the text (spans partition
//! it in order) and is prefixed with up to `overlap_chars` characters taken
//! from just before its span, so retrieval keeps context across boundaries.
//!
//! Cut points prefer paragraph breaks, then line breaks, then sentence ends,
//! then whitespace; a hard cut at a character boundary is the last resort.
//!
//! Chunk IDs are UUIDv5 of `"<document id>#<index>"`, so chunking the same
//! text again yields the same IDs.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Namespace for chunk UUIDs.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6b1d_4f2a_9c3e_5e70_8a41_d2c9_0f37_b815);

/// Boundaries closer than `budget / MIN_SPAN_DIVISOR` to the window start are
/// ignored, which keeps a stray early newline from producing a sliver chunk.
const MIN_SPAN_DIVISOR: usize = 4;

/// Normalize whitespace so chunking is independent of platform line endings.
pub fn normalize_text(text: &str) -> String {
    let unified = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{0c}', "\n\n");

    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;
    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

/// Split already-normalized text into chunks. Empty text yields no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_chars: usize,
    overlap_chars: usize,
) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let overlap_chars = overlap_chars.min(max_chars - 1);

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut chunk_index: i64 = 0;

    while pos < text.len() {
        let overlap_start = if pos == 0 {
            pos
        } else {
            overlap_start(text, pos, overlap_chars)
        };
        let overlap_len = text[overlap_start..pos].chars().count();
        let budget = max_chars - overlap_len;

        let window_end = advance_chars(text, pos, budget);
        let cut = if window_end >= text.len() {
            text.len()
        } else {
            find_cut(text, pos, window_end, budget)
        };

        let piece = text[overlap_start..cut].trim();
        if !piece.is_empty() || chunks.is_empty() {
            chunks.push(make_chunk(document_id, chunk_index, piece, pos, cut));
            chunk_index += 1;
        } else if let Some(last) = chunks.last_mut() {
            // Whitespace-only tail: fold it into the previous span.
            last.end = cut;
        }
        pos = cut;
    }

    chunks
}

/// Start of the overlap region ending at `pos`, nudged forward past a
/// partial word when a word boundary is available.
fn overlap_start(text: &str, pos: usize, overlap_chars: usize) -> usize {
    if overlap_chars == 0 {
        return pos;
    }
    let start = back_chars(text, pos, overlap_chars);
    let region = &text[start..pos];
    match region.find(char::is_whitespace) {
        Some(idx) => {
            let ws_len = region[idx..].chars().next().map_or(1, char::len_utf8);
            let adjusted = start + idx + ws_len;
            if adjusted < pos {
                adjusted
            } else {
                start
            }
        }
        None => start,
    }
}

fn find_cut(text: &str, pos: usize, window_end: usize, budget: usize) -> usize {
    let window = &text[pos..window_end];
    let min = advance_chars(window, 0, budget / MIN_SPAN_DIVISOR);
    let searchable = &window[min..];

    if let Some(idx) = searchable.rfind("\n\n") {
        return pos + min + idx + 2;
    }
    if let Some(idx) = searchable.rfind('\n') {
        return pos + min + idx + 1;
    }
    let sentence_end = [". ", "! ", "? ", ".\t"]
        .iter()
        .filter_map(|pat| searchable.rfind(pat))
        .max();
    if let Some(idx) = sentence_end {
        return pos + min + idx + 2;
    }
    if let Some(idx) = searchable.rfind(char::is_whitespace) {
        let ws_len = searchable[idx..].chars().next().map_or(1, char::len_utf8);
        return pos + min + idx + ws_len;
    }
    window_end
}

/// Byte index `n` characters after `from`, capped at the end of `s`.
fn advance_chars(s: &str, from: usize, n: usize) -> usize {
    s[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(s.len())
}

/// Byte index `n` characters before `to`, floored at 0.
fn back_chars(s: &str, to: usize, n: usize) -> usize {
    if n == 0 {
        return to;
    }
    s[..to]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub fn chunk_id(document_id: &str, index: i64) -> String {
    Uuid::new_v5(
        &CHUNK_NAMESPACE,
        format!("{}#{}", document_id, index).as_bytes(),
    )
    .to_string()
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: i64, text: &str, start: usize, end: usize) -> Chunk {
    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
        char_len: text.chars().count(),
        start,
        end,
    }
}
