//! Keyword intent classification and the tool-necessity gate.
//!
//! Both are cheap heuristics that bound LLM token spend. They are traits so
//! a tenant can swap in a better classifier without touching the loop.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    MemoryStore,
    MemorySearch,
    MemoryUpdate,
    ApiCall,
    Schedule,
    Conversational,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MemoryStore => "memory_store",
            Self::MemorySearch => "memory_search",
            Self::MemoryUpdate => "memory_update",
            Self::ApiCall => "api_call",
            Self::Schedule => "schedule",
            Self::Conversational => "conversational",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait IntentClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, text: &str) -> Intent;
}

/// Decides whether a message should enter the tool loop.
pub trait ToolGate: Send + Sync + std::fmt::Debug {
    fn requires_tools(&self, text: &str, intent: Intent) -> bool;
}

/// Lowercased words; apostrophes stay inside words (`what's`).
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `phrase` occurs as a run of whole words in `haystack`.
fn contains_phrase(haystack: &[String], phrase: &str) -> bool {
    let needle = words(phrase);
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle.as_slice())
}

const DEFAULT_KEYWORDS: [(Intent, &[&str]); 6] = [
    (
        Intent::MemoryStore,
        &["remember", "save", "store", "note", "write down", "keep track", "record"],
    ),
    (
        Intent::MemorySearch,
        &["find", "search", "look for", "recall", "what did", "do i have", "show me"],
    ),
    (
        Intent::MemoryUpdate,
        &["change", "update", "modify", "edit", "correct", "fix"],
    ),
    (Intent::ApiCall, &["weather", "call", "get data", "check", "fetch"]),
    (
        Intent::Schedule,
        &["remind me", "schedule", "set reminder", "notify me"],
    ),
    (
        Intent::Conversational,
        &["hello", "hi", "how are you", "thanks", "thank you", "bye"],
    ),
];

/// Ordered keyword table; the first intent with a matching phrase wins and
/// anything unmatched is conversational.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    table: Vec<(Intent, Vec<String>)>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            table: DEFAULT_KEYWORDS
                .iter()
                .map(|(intent, phrases)| (*intent, phrases.iter().map(ToString::to_string).collect()))
                .collect(),
        }
    }
}

impl KeywordClassifier {
    pub fn new(table: Vec<(Intent, Vec<String>)>) -> Self {
        Self { table }
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        let words = words(text);
        self.table
            .iter()
            .find(|(_, phrases)| phrases.iter().any(|p| contains_phrase(&words, p)))
            .map_or(Intent::Conversational, |(intent, _)| *intent)
    }
}

const GREETINGS: [&str; 18] = [
    "hello",
    "hi",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "how are you",
    "what's up",
    "thanks",
    "thank you",
    "bye",
    "goodbye",
    "ok",
    "okay",
    "sure",
    "alright",
    "got it",
    "understood",
];

/// Word count above which an unclassified message still gets tools.
pub const LONG_MESSAGE_WORDS: usize = 8;
/// Greetings of at most this many words never get tools.
pub const SHORT_GREETING_WORDS: usize = 3;

/// Gate policy: conversational intents and short greetings skip tools,
/// intents in `tool_intents` always get them, anything else gets them only
/// when it is longer than [`LONG_MESSAGE_WORDS`].
#[derive(Debug, Clone)]
pub struct DefaultToolGate {
    tool_intents: Vec<Intent>,
}

impl Default for DefaultToolGate {
    fn default() -> Self {
        Self {
            tool_intents: vec![
                Intent::MemoryStore,
                Intent::MemorySearch,
                Intent::MemoryUpdate,
                Intent::ApiCall,
                Intent::Schedule,
            ],
        }
    }
}

impl DefaultToolGate {
    pub fn with_tool_intents(tool_intents: Vec<Intent>) -> Self {
        Self { tool_intents }
    }
}

impl ToolGate for DefaultToolGate {
    fn requires_tools(&self, text: &str, intent: Intent) -> bool {
        if intent == Intent::Conversational {
            return false;
        }

        let word_count = text.split_whitespace().count();
        let lowered = words(text);
        if word_count <= SHORT_GREETING_WORDS && GREETINGS.iter().any(|g| contains_phrase(&lowered, g)) {
            return false;
        }

        if self.tool_intents.contains(&intent) {
            return true;
        }

        word_count > LONG_MESSAGE_WORDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_intent_wins() {
        let classifier = KeywordClassifier::default();
        assert_eq!(classifier.classify("Remember to buy milk"), Intent::MemoryStore);
        // "save" (store) is listed before "find" (search)
        assert_eq!(classifier.classify("find and save my notes"), Intent::MemoryStore);
        assert_eq!(classifier.classify("Do I have anything tomorrow?"), Intent::MemorySearch);
        assert_eq!(classifier.classify("please update my address"), Intent::MemoryUpdate);
        assert_eq!(classifier.classify("what's the weather in Porto"), Intent::ApiCall);
        assert_eq!(classifier.classify("remind me at 5"), Intent::Schedule);
        assert_eq!(classifier.classify("hi there"), Intent::Conversational);
    }

    #[test]
    fn test_unmatched_defaults_to_conversational() {
        let classifier = KeywordClassifier::default();
        assert_eq!(classifier.classify("tell me a story"), Intent::Conversational);
        assert_eq!(classifier.classify(""), Intent::Conversational);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        let classifier = KeywordClassifier::default();
        // "this" must not match "hi", "recorder" must not match "record"
        assert_eq!(classifier.classify("is this a recorder"), Intent::Conversational);
    }

    #[test]
    fn test_custom_table() {
        let classifier = KeywordClassifier::new(vec![(Intent::Schedule, vec!["agenda".to_string()])]);
        assert_eq!(classifier.classify("my agenda"), Intent::Schedule);
        assert_eq!(classifier.classify("remember this"), Intent::Conversational);
    }

    #[test]
    fn test_gate_policy() {
        let gate = DefaultToolGate::default();
        assert!(!gate.requires_tools("remember the milk", Intent::Conversational));
        assert!(gate.requires_tools("remember to buy milk", Intent::MemoryStore));
        // short acknowledgement wins over a tool intent
        assert!(!gate.requires_tools("ok save it", Intent::MemoryStore));
        assert!(gate.requires_tools("ok save it for me later please", Intent::MemoryStore));
    }

    #[test]
    fn test_gate_word_count_fallback() {
        let gate = DefaultToolGate::with_tool_intents(vec![Intent::MemoryStore]);
        assert!(!gate.requires_tools("check the pressure", Intent::ApiCall));
        assert!(gate.requires_tools(
            "check the tyre pressure on the car before the long trip",
            Intent::ApiCall
        ));
    }
}
