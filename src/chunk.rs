//! Paragraph-boundary passage splitter.
//!
//! Splits document text into [`Passage`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to keep each passage coherent; a paragraph longer than the limit is hard
//! split at the last newline or space before the boundary.
//!
//! Each passage records the most recent markdown heading seen at or before
//! its first paragraph, so answers can cite a section and not only a file.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Passage;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into passages on paragraph boundaries, respecting `max_tokens`.
/// Returns passages with contiguous indices starting at 0; whitespace-only
/// text yields no passages.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Passage> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut passages = Vec::new();
    let mut current_buf = String::new();
    let mut buf_section: Option<String> = None;
    let mut section: Option<String> = None;
    let mut chunk_index: i64 = 0;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(heading) = markdown_heading(trimmed) {
            section = Some(heading);
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            passages.push(make_passage(
                document_id,
                chunk_index,
                &current_buf,
                buf_section.take(),
            ));
            chunk_index += 1;
            current_buf.clear();
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    passages.push(make_passage(
                        document_id,
                        chunk_index,
                        piece,
                        section.clone(),
                    ));
                    chunk_index += 1;
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if current_buf.is_empty() {
                buf_section = section.clone();
            } else {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        passages.push(make_passage(
            document_id,
            chunk_index,
            &current_buf,
            buf_section,
        ));
    }

    passages
}

/// Text of a markdown ATX heading (`# Title`), if the paragraph starts with one.
fn markdown_heading(paragraph: &str) -> Option<String> {
    let first_line = paragraph.lines().next()?.trim();
    let hashes = first_line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &first_line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// Largest index `<= max` that lies on a char boundary (and is > 0 when possible).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        // A single char wider than the limit; take it whole.
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        idx
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_passage(document_id: &str, index: i64, text: &str, section: Option<String>) -> Passage {
    Passage {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hash_text(text),
        section,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_passage() {
        let passages = chunk_text("doc1", "Hello, world!", 700);
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].chunk_index, 0);
        assert_eq!(passages[0].text, "Hello, world!");
        assert_eq!(passages[0].document_id, "doc1");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk_text("doc1", "", 700).is_empty());
        assert!(chunk_text("doc1", "  \n\n \n", 700).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let passages = chunk_text("doc1", text, 700);
        assert_eq!(passages.len(), 1);
        assert!(passages[0].text.contains("First paragraph."));
        assert!(passages[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let passages = chunk_text("doc1", &text, 10);
        assert!(passages.len() > 1);
        for (i, p) in passages.iter().enumerate() {
            assert_eq!(p.chunk_index, i as i64, "Index mismatch at position {}", i);
            assert!(p.text.len() <= 40);
        }
    }

    #[test]
    fn test_long_paragraph_hard_split_on_spaces() {
        let text = "word ".repeat(100);
        let passages = chunk_text("doc1", &text, 5);
        assert!(passages.len() > 1);
        for p in &passages {
            assert!(p.text.len() <= 20);
            assert!(!p.text.starts_with(' '));
        }
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "é".repeat(50);
        let passages = chunk_text("doc1", &text, 2);
        let joined: String = passages.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_sections_follow_headings() {
        let text = "# Cells\n\nCells are the unit of life.\n\n## Mitochondria\n\nThe powerhouse.";
        let passages = chunk_text("doc1", text, 8);
        let last = passages.last().unwrap();
        assert!(last.text.contains("powerhouse"));
        assert_eq!(last.section.as_deref(), Some("Mitochondria"));
        assert_eq!(passages[0].section.as_deref(), Some("Cells"));
    }

    #[test]
    fn test_heading_parsing() {
        assert_eq!(markdown_heading("## Title ##"), Some("Title".to_string()));
        assert_eq!(markdown_heading("#hashtag"), None);
        assert_eq!(markdown_heading("plain"), None);
    }

    #[test]
    fn test_deterministic_text_and_hash() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_text("doc1", text, 2);
        let b = chunk_text("doc1", text, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.chunk_index, y.chunk_index);
        }
    }
}
