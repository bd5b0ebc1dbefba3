//! Search post-processing: near-duplicate removal and query-sensitive boosts.
//!
//! The boosts are best-effort relevance tuning, not guarantees. They are
//! multiplicative, so they only reorder hits within one backend's scale.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use super::{MemoryHit, MemoryKind};

/// Hits whose word-set Jaccard similarity to an accepted hit exceeds this
/// are dropped.
pub const DUPLICATE_THRESHOLD: f64 = 0.9;

const RECENCY_WORDS: [&str; 2] = ["recent", "latest"];
const TASK_WORDS: [&str; 2] = ["task", "todo"];
const SCHEDULE_WORDS: [&str; 3] = ["schedule", "appointment", "meeting"];

const BOOST_LAST_DAY: f32 = 1.2;
const BOOST_LAST_WEEK: f32 = 1.1;
const BOOST_KIND_MATCH: f32 = 1.15;

/// Jaccard similarity of the lowercased whitespace-separated word sets.
///
/// Two empty texts are identical; one empty text shares nothing.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let set_a: HashSet<&str> = a.split_whitespace().collect();
    let set_b: HashSet<&str> = b.split_whitespace().collect();

    match (set_a.is_empty(), set_b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        (false, false) => {}
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.len() + set_b.len() - intersection;

    #[allow(clippy::cast_precision_loss)]
    let similarity = intersection as f64 / union as f64;
    similarity
}

/// Keep the first of every group of near-identical hits, preserving order.
pub fn deduplicate(hits: Vec<MemoryHit>) -> Vec<MemoryHit> {
    if hits.len() <= 1 {
        return hits;
    }

    let mut unique: Vec<MemoryHit> = Vec::with_capacity(hits.len());
    for hit in hits {
        let duplicate = unique
            .iter()
            .any(|kept| text_similarity(&hit.text, &kept.text) > DUPLICATE_THRESHOLD);
        if !duplicate {
            unique.push(hit);
        }
    }
    unique
}

fn mentions(query: &str, words: &[&str]) -> bool {
    words.iter().any(|w| query.contains(w))
}

/// Multiply scores according to what the query asks about.
///
/// - recency words: ×1.2 if `metadata.created_at` is under a day old, ×1.1 if
///   under a week;
/// - task words: ×1.15 for tasks;
/// - schedule words: ×1.15 for events.
pub fn apply_query_boosts(hits: &mut [MemoryHit], query: &str, now: DateTime<Utc>) {
    let query = query.to_lowercase();
    let recency = mentions(&query, &RECENCY_WORDS);
    let tasks = mentions(&query, &TASK_WORDS);
    let schedule = mentions(&query, &SCHEDULE_WORDS);

    for hit in hits.iter_mut() {
        if recency {
            if let Some(created_at) = created_at(hit) {
                let age = now - created_at;
                if age < Duration::hours(24) {
                    hit.score *= BOOST_LAST_DAY;
                } else if age < Duration::days(7) {
                    hit.score *= BOOST_LAST_WEEK;
                }
            }
        }
        if tasks && hit.kind == MemoryKind::Task {
            hit.score *= BOOST_KIND_MATCH;
        }
        if schedule && hit.kind == MemoryKind::Event {
            hit.score *= BOOST_KIND_MATCH;
        }
    }
}

fn created_at(hit: &MemoryHit) -> Option<DateTime<Utc>> {
    hit.metadata
        .get("created_at")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Stable sort, highest score first.
pub fn sort_by_score(hits: &mut [MemoryHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Metadata;
    use serde_json::json;
    use uuid::Uuid;

    fn hit(kind: MemoryKind, text: &str, score: f32) -> MemoryHit {
        MemoryHit {
            id: Uuid::new_v4(),
            kind,
            text: text.to_string(),
            score,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_similarity_edge_cases() {
        assert!((text_similarity("", "  ") - 1.0).abs() < f64::EPSILON);
        assert!(text_similarity("", "milk").abs() < f64::EPSILON);
        assert!((text_similarity("Buy Milk", "buy milk") - 1.0).abs() < f64::EPSILON);
        assert!((text_similarity("a b", "b c") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_near_duplicates_collapse_to_first() {
        let hits = vec![
            hit(MemoryKind::Task, "buy milk and eggs", 0.9),
            hit(MemoryKind::Task, "Buy milk and EGGS", 0.85),
            hit(MemoryKind::Note, "call the dentist", 0.8),
        ];
        let unique = deduplicate(hits);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].text, "buy milk and eggs");
        assert_eq!(unique[1].text, "call the dentist");
    }

    #[test]
    fn test_task_and_schedule_boosts() {
        let mut hits = vec![
            hit(MemoryKind::Task, "a", 0.8),
            hit(MemoryKind::Event, "b", 0.8),
            hit(MemoryKind::Note, "c", 0.8),
        ];
        apply_query_boosts(&mut hits, "my TODO list and next meeting", Utc::now());
        assert!((hits[0].score - 0.8 * 1.15).abs() < 1e-6);
        assert!((hits[1].score - 0.8 * 1.15).abs() < 1e-6);
        assert!((hits[2].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_recency_boost_uses_created_at() {
        let now = Utc::now();
        let mut fresh = hit(MemoryKind::Note, "a", 0.5);
        fresh.metadata.insert("created_at".into(), json!((now - Duration::hours(2)).to_rfc3339()));
        let mut week = hit(MemoryKind::Note, "b", 0.5);
        week.metadata.insert("created_at".into(), json!((now - Duration::days(3)).to_rfc3339()));
        let mut old = hit(MemoryKind::Note, "c", 0.5);
        old.metadata.insert("created_at".into(), json!((now - Duration::days(30)).to_rfc3339()));

        let mut hits = vec![fresh, week, old];
        apply_query_boosts(&mut hits, "what's the latest", now);
        assert!((hits[0].score - 0.6).abs() < 1e-6);
        assert!((hits[1].score - 0.55).abs() < 1e-6);
        assert!((hits[2].score - 0.5).abs() < 1e-6);

        let mut untouched = vec![hit(MemoryKind::Task, "d", 0.5)];
        apply_query_boosts(&mut untouched, "milk", now);
        assert!((untouched[0].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sort_by_score_is_descending() {
        let mut hits = vec![hit(MemoryKind::Note, "a", 0.2), hit(MemoryKind::Note, "b", 0.9)];
        sort_by_score(&mut hits);
        assert_eq!(hits[0].text, "b");
    }
}
