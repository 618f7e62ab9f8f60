//! Calendar titles for todo shadow events

use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const MAX_TITLE_CHARS: usize = 50;
pub const MAX_DETAILS_CHARS: usize = 160;

const FALLBACK_TITLE: &str = "Todo";
const TRIM_CHARS: &[char] = &[' ', ',', '.', ';', ':', '!', '-'];

/// Title plus the longer text it was condensed from, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoTitle {
    pub title: String,
    pub details: Option<String>,
}

impl TodoTitle {
    fn plain(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            details: None,
        }
    }
}

/// Produces a short title for long todo text
#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate(&self, normalized: &str) -> anyhow::Result<TodoTitle>;
}

/// Word-boundary shortening with no external calls
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTitler;

#[async_trait]
impl TitleGenerator for HeuristicTitler {
    async fn generate(&self, normalized: &str) -> anyhow::Result<TodoTitle> {
        Ok(fallback_title(normalized))
    }
}

/// Collapse whitespace and drop a leading bullet or `todo:`/`task-` prefix
pub fn normalize_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let without_bullet = strip_bullet(&collapsed);
    strip_prefix_word(without_bullet).to_string()
}

fn strip_bullet(text: &str) -> &str {
    match text.strip_prefix(['•', '-', '*']) {
        Some(rest) => rest.trim_start(),
        None => text,
    }
}

fn strip_prefix_word(text: &str) -> &str {
    for word in ["todo", "task"] {
        let Some(head) = text.get(..word.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(word) {
            continue;
        }
        if let Some(rest) = text[word.len()..].strip_prefix([':', '-']) {
            return rest.trim_start();
        }
    }
    text
}

/// Stable hash of the normalised text, hex-encoded SHA-256
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_text(text).as_bytes()))
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Cut at the last space within `max` chars, unless that loses too much
pub fn shorten(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if char_len(text) <= max {
        return text.to_string();
    }
    let candidate = take_chars(text, max + 1);
    let min_cut = (max / 2).max(6);
    let cutoff = match candidate.rfind(' ') {
        Some(byte_idx) if char_len(&candidate[..byte_idx]) >= min_cut => &candidate[..byte_idx],
        _ => take_chars(text, max),
    };
    take_chars(cutoff.trim_end_matches(TRIM_CHARS), max).to_string()
}

fn fallback_title(normalized: &str) -> TodoTitle {
    let title = shorten(normalized, MAX_TITLE_CHARS);
    if title.is_empty() {
        return TodoTitle::plain(FALLBACK_TITLE);
    }
    let details = (!normalized.eq_ignore_ascii_case(&title))
        .then(|| shorten(normalized, MAX_DETAILS_CHARS));
    TodoTitle { title, details }
}

fn sanitize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("...", "")
        .replace('\u{2026}', "")
}

/// Title for a todo's text: short text verbatim, long text condensed
pub async fn build_title(generator: &dyn TitleGenerator, text: &str) -> TodoTitle {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return TodoTitle::plain(FALLBACK_TITLE);
    }
    if char_len(&normalized) <= MAX_TITLE_CHARS {
        return TodoTitle::plain(normalized);
    }

    match generator.generate(&normalized).await {
        Ok(generated) => {
            let title = shorten(
                sanitize(&generated.title).trim_end_matches(TRIM_CHARS),
                MAX_TITLE_CHARS,
            );
            if title.is_empty() {
                return fallback_title(&normalized);
            }
            let details = generated
                .details
                .map(|d| sanitize(&d).trim().to_string())
                .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case(&title))
                .map(|d| shorten(&d, MAX_DETAILS_CHARS));
            TodoTitle { title, details }
        }
        Err(err) => {
            tracing::warn!(error = %err, "Title generation failed; using shortened text");
            fallback_title(&normalized)
        }
    }
}
