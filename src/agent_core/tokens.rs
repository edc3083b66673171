//! Conversation size measurement.
//!
//! Token counts use character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)
//!
//! Word and sentence counts are plain text statistics over message text.

use crate::inference::types::{Message, Sender};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Overhead for tool call JSON structure (per call).
const TOOL_CALL_OVERHEAD_TOKENS: u64 = 10;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tokens ─────────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u64
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u64 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u64
}

/// Estimate the token count for one message.
///
/// Tool results and tool-call arguments are JSON and use the denser ratio.
pub fn estimate_message_tokens(message: &Message) -> u64 {
    let mut total = MESSAGE_OVERHEAD_TOKENS;

    total += match message.sender {
        Sender::ToolResult => estimate_json_tokens(&message.text),
        _ => estimate_tokens(&message.text),
    };

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            total += TOOL_CALL_OVERHEAD_TOKENS;
            total += estimate_tokens(&call.name);
            total += estimate_json_tokens(&call.arguments.to_string());
        }
    }

    total
}

// ─── Words & Sentences ──────────────────────────────────────────────────────

/// Whitespace-separated word count.
pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Sentence count: non-blank fragments between `.`, `!`, `?` and newlines.
///
/// Text without terminal punctuation still counts as one sentence.
pub fn count_sentences(text: &str) -> u64 {
    text.split(['.', '!', '?', '\n'])
        .filter(|frag| frag.chars().any(char::is_alphanumeric))
        .count() as u64
}

// ─── Tests ──────────────────────────────────────────────────────────────────
