//! # Text Chunker
//!
//! Fixed-size chunking with sentence-boundary preference and optional
//! overlap. Each chunk carries its ordinal so downstream aggregation stays
//! ordered regardless of completion order.

use serde::{Deserialize, Serialize};

/// Chunking policy for `local_chunk_process` steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPolicy {
    /// Maximum characters per chunk
    pub max_chars: usize,
    /// Characters of trailing context repeated at the start of the next chunk
    pub overlap_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 100,
        }
    }
}

/// One chunk of a larger text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based position within the original text
    pub ordinal: usize,
    pub text: String,
}

const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// Split text into chunks of at most `max_chars`, preferring to break just
/// after a sentence terminator in the second half of the window.
pub fn chunk_text(text: &str, policy: &ChunkPolicy) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let max = policy.max_chars.max(1);
    let overlap = policy.overlap_chars.min(max.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + max).min(chars.len());

        let end = if hard_end == chars.len() {
            hard_end
        } else {
            // Prefer a sentence boundary in the back half of the window
            let floor = start + max / 2;
            let boundary = (floor..hard_end)
                .rev()
                .find(|&i| SENTENCE_TERMINATORS.contains(&chars[i]))
                .map(|i| i + 1);
            boundary.unwrap_or(hard_end)
        };

        let chunk_text: String = chars[start..end].iter().collect();
        chunks.push(Chunk {
            ordinal: chunks.len(),
            text: chunk_text,
        });

        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("short text", &ChunkPolicy::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "short text");
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_text("", &ChunkPolicy::default()).is_empty());
    }

    #[test]
    fn test_sentence_boundary_preferred() {
        let policy = ChunkPolicy {
            max_chars: 30,
            overlap_chars: 0,
        };
        let text = "First sentence here. Second one follows after it for a while.";
        let chunks = chunk_text(text, &policy);

        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.ends_with('.'), "chunk: {:?}", chunks[0].text);
        assert_eq!(chunks[0].text, "First sentence here.");
    }

    #[test]
    fn test_hard_split_without_boundary() {
        let policy = ChunkPolicy {
            max_chars: 10,
            overlap_chars: 0,
        };
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = chunk_text(text, &policy);

        assert_eq!(chunks[0].text, "abcdefghij");
        assert_eq!(chunks[1].text, "klmnopqrst");
        assert_eq!(chunks[2].text, "uvwxyz");
    }

    #[test]
    fn test_ordinals_sequential() {
        let policy = ChunkPolicy {
            max_chars: 5,
            overlap_chars: 0,
        };
        let chunks = chunk_text("aaaaabbbbbccccc", &policy);
        let ordinals: Vec<usize> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn test_overlap_repeats_context() {
        let policy = ChunkPolicy {
            max_chars: 10,
            overlap_chars: 3,
        };
        let chunks = chunk_text("abcdefghijklmnop", &policy);

        // Second chunk starts 3 chars before the first chunk's end
        assert_eq!(chunks[0].text, "abcdefghij");
        assert!(chunks[1].text.starts_with("hij"));
    }

    #[test]
    fn test_coverage_complete_without_overlap() {
        let policy = ChunkPolicy {
            max_chars: 7,
            overlap_chars: 0,
        };
        let text = "the quick brown fox jumps over";
        let chunks = chunk_text(text, &policy);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_multibyte_safe() {
        let policy = ChunkPolicy {
            max_chars: 4,
            overlap_chars: 0,
        };
        let chunks = chunk_text("日本語のテキストです", &policy);
        assert!(chunks.len() >= 2);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, "日本語のテキストです");
    }
}
