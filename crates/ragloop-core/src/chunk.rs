//! Paragraph-packing chunker.
//!
//! Paragraphs (separated by a blank line) are packed greedily into chunks of
//! at most `max_tokens * 4` bytes. A paragraph that is longer than a chunk on
//! its own is cut at the last whitespace before the limit, or mid-word when
//! there is none. Cuts always land on UTF-8 character boundaries.
//!
//! ```rust
//! use ragloop_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position, 0);
//! ```

use sha2::{Digest, Sha256};

use crate::models::ChunkRecord;

/// Rough bytes-per-token ratio for English text.
const BYTES_PER_TOKEN: usize = 4;

const PARAGRAPH_BREAK: &str = "\n\n";

/// Split `text` into chunks with contiguous positions from 0. Blank text
/// yields no chunks.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<ChunkRecord> {
    let limit = max_tokens.saturating_mul(BYTES_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut pending = String::new();

    for paragraph in text.split(PARAGRAPH_BREAK).map(str::trim) {
        if paragraph.is_empty() {
            continue;
        }

        if paragraph.len() > limit {
            if !pending.is_empty() {
                pieces.push(std::mem::take(&mut pending));
            }
            pieces.extend(split_oversized(paragraph, limit).map(str::to_string));
            continue;
        }

        let packed_len = if pending.is_empty() {
            paragraph.len()
        } else {
            pending.len() + PARAGRAPH_BREAK.len() + paragraph.len()
        };
        if packed_len > limit {
            pieces.push(std::mem::take(&mut pending));
        }
        if !pending.is_empty() {
            pending.push_str(PARAGRAPH_BREAK);
        }
        pending.push_str(paragraph);
    }
    if !pending.is_empty() {
        pieces.push(pending);
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| ChunkRecord::new(document_id, piece, i as i64))
        .collect()
}

/// Cut one long paragraph into trimmed, non-empty pieces of at most `limit`
/// bytes (a single character wider than `limit` still forms its own piece).
fn split_oversized(paragraph: &str, limit: usize) -> impl Iterator<Item = &str> {
    let mut rest = paragraph;
    std::iter::from_fn(move || loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let cut = cut_point(rest, limit);
        let (head, tail) = rest.split_at(cut);
        rest = tail;
        let head = head.trim_end();
        if !head.is_empty() {
            return Some(head);
        }
    })
}

fn cut_point(s: &str, limit: usize) -> usize {
    if s.len() <= limit {
        return s.len();
    }
    let mut hard = limit;
    while !s.is_char_boundary(hard) {
        hard -= 1;
    }
    if hard == 0 {
        // First character alone exceeds the limit.
        return s.chars().next().map_or(s.len(), char::len_utf8);
    }
    match s[..hard].rfind(char::is_whitespace) {
        Some(ws) if ws > 0 => ws,
        _ => hard,
    }
}

/// Hex SHA-256 of a text, used for chunk hashes and document change detection.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].hash, content_hash("Hello, world!"));
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("doc1", "", 700).is_empty());
        assert!(chunk_text("doc1", " \n\n ", 700).is_empty());
    }

    #[test]
    fn test_paragraphs_packed_until_limit() {
        // limit = 2 tokens * 4 = 8 bytes
        let chunks = chunk_text("doc1", "aaa\n\nbbb\n\ncccccc", 2);
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["aaa\n\nbbb", "cccccc"]);
        assert_eq!(chunks[1].position, 1);
    }

    #[test]
    fn test_long_paragraph_cut_at_whitespace() {
        let chunks = chunk_text("doc1", "alpha beta gamma delta", 3);
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn test_positions_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {i}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.position, i as i64);
        }
    }

    #[test]
    fn test_multibyte_text_never_splits_a_char() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text("doc1", text, 1);
        assert!(!chunks.is_empty());
        let rejoined: String = chunks.iter().map(|c| c.content.replace(char::is_whitespace, "")).collect();
        assert_eq!(rejoined, text.replace(char::is_whitespace, ""));
    }

    #[test]
    fn test_same_text_same_content_fresh_ids() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_text("doc1", text, 2);
        let b = chunk_text("doc1", text, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.content, y.content);
            assert_eq!(x.hash, y.hash);
            assert_ne!(x.chunk_id, y.chunk_id);
        }
    }
}
