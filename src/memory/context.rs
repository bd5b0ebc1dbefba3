//! Token-budgeted rendering of memory hits for prompt injection.

use chrono::DateTime;

use super::{MemoryHit, Metadata};

pub const CONTEXT_HEADER: &str = "Relevant context from your memory:";

/// Headroom needed before a truncated partial line is attempted.
const PARTIAL_LINE_HEADROOM: usize = 100;
/// Tokens held back from the partial line for its suffix and rounding.
const PARTIAL_LINE_RESERVE: usize = 20;

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Cut `text` to about `max_tokens`, preferring a word boundary when one
/// exists in the second half of the kept span.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let kept: String = text.chars().take(max_chars).collect();
    match kept.rfind(' ') {
        Some(byte_idx) if kept[..byte_idx].chars().count() > max_chars / 2 => kept[..byte_idx].to_string(),
        _ => kept,
    }
}

/// `Mon D, HH:MM` from `created_at`, else `stored_at`, else `"unknown"`.
/// Unparseable timestamps are shown as stored.
pub fn format_timestamp(metadata: &Metadata) -> String {
    for key in ["created_at", "stored_at"] {
        if let Some(raw) = metadata.get(key).and_then(serde_json::Value::as_str) {
            return DateTime::parse_from_rfc3339(raw)
                .map_or_else(|_| raw.to_string(), |dt| dt.format("%b %-d, %H:%M").to_string());
        }
    }
    "unknown".to_string()
}

pub fn format_hit(hit: &MemoryHit) -> String {
    format!(
        "- {} ({}, score: {:.2}): {}",
        hit.kind,
        format_timestamp(&hit.metadata),
        hit.score,
        hit.text
    )
}

/// Render hits under a header, one line each, until `max_tokens` would be
/// exceeded. If at least 100 tokens remain at that point, one truncated
/// line ending in `...` is added. Empty input renders as an empty string.
pub fn build_context(hits: &[MemoryHit], max_tokens: usize) -> String {
    if hits.is_empty() {
        return String::new();
    }

    let mut lines = vec![CONTEXT_HEADER.to_string()];
    let mut used = estimate_tokens(CONTEXT_HEADER);

    for hit in hits {
        let line = format_hit(hit);
        let cost = estimate_tokens(&line);

        if used + cost > max_tokens {
            if used + PARTIAL_LINE_HEADROOM <= max_tokens {
                let budget = max_tokens - used - PARTIAL_LINE_RESERVE;
                lines.push(format!("{}...", truncate_to_tokens(&line, budget)));
            }
            break;
        }

        lines.push(line);
        used += cost;
    }

    lines.join("\n")
}
