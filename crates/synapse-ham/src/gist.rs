//! # Gist Abstraction
//!
//! Reduces raw textual experience to a structured short form: first-sentence
//! summary, frequency-ranked keywords, and the original length. The
//! language-specific fields (`radicals`, `pos_tags`) are reserved in the
//! shape and may carry placeholder values; retrieval never depends on them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keywords kept per gist
const KEYWORD_LIMIT: usize = 5;

/// Tokens too common to carry signal
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "i",
    "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "we", "were",
    "what", "which", "will", "with", "you",
];

/// Structured short form of a textual experience
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gist {
    pub summary: String,
    pub keywords: Vec<String>,
    pub original_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Reserved: radical decomposition for CJK-like text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radicals: Option<Value>,
    /// Reserved: part-of-speech-like markers for Latin-script text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_tags: Option<Value>,
}

/// Data types whose payloads get the structured text abstraction.
///
/// Everything else is stored as an opaque UTF-8 string at this layer.
pub fn is_textual_data_type(data_type: &str) -> bool {
    data_type.starts_with("dialogue_text")
        || data_type.starts_with("dialogue_")
        || data_type.starts_with("document_text")
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7AF)
}

fn detect_language(raw: &str) -> Option<String> {
    if raw.chars().any(is_cjk) {
        Some("zh".to_string())
    } else if raw.chars().any(|c| c.is_ascii_alphabetic()) {
        Some("en".to_string())
    } else {
        None
    }
}

fn first_sentence(raw: &str) -> String {
    let trimmed = raw.trim();
    let terminators = ['.', '!', '?', '。', '！', '？'];

    match trimmed.find(terminators) {
        Some(pos) => {
            let end = pos + trimmed[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            trimmed[..end].trim().to_string()
        }
        None => trimmed.to_string(),
    }
}

fn top_keywords(raw: &str) -> Vec<String> {
    let mut frequency: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for token in raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
    {
        let token = token.to_lowercase();
        if STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        let count = frequency.entry(token.clone()).or_insert(0);
        if *count == 0 {
            order.push(token);
        }
        *count += 1;
    }

    // Rank by frequency, breaking ties by first appearance
    let mut ranked: Vec<String> = order;
    ranked.sort_by(|a, b| frequency[b].cmp(&frequency[a]));
    ranked.truncate(KEYWORD_LIMIT);
    ranked
}

/// Abstract raw text into a [`Gist`]
pub fn abstract_text(raw: &str) -> Gist {
    let language = detect_language(raw);

    // Placeholder linguistic detail; kept shallow on purpose so nothing
    // downstream can become load-bearing on it.
    let (radicals, pos_tags) = match language.as_deref() {
        Some("zh") => (Some(Value::Array(Vec::new())), None),
        Some("en") => (None, Some(Value::Array(Vec::new()))),
        _ => (None, None),
    };

    Gist {
        summary: first_sentence(raw),
        keywords: top_keywords(raw),
        original_length: raw.chars().count(),
        language,
        radicals,
        pos_tags,
    }
}
