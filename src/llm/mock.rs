//! Deterministic offline provider.
//!
//! Embeddings are hashed bag-of-words vectors, so texts sharing words are
//! close under cosine similarity. Chat replies follow a small keyword script
//! that exercises the tool loop; scripted responses can be queued for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, MessageRole, TokenUsage, ToolCall};
use crate::error::{CoreError, CoreResult};

pub const MOCK_EMBEDDING_DIMENSIONS: usize = 64;

#[derive(Debug, Clone)]
enum Script {
    /// Keyword-triggered tool calls, then a summary reply.
    Auto,
    /// Request the same tool call on every round.
    AlwaysCall { name: String, arguments: String },
}

#[derive(Debug)]
pub struct MockProvider {
    script: Script,
    dimensions: usize,
    fail_embeddings: bool,
    /// 1-based chat round that fails.
    fail_chat_on: Option<usize>,
    queued: Mutex<VecDeque<ChatMessage>>,
    requests: Mutex<Vec<ChatRequest>>,
    call_counter: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Script::Auto,
            dimensions: MOCK_EMBEDDING_DIMENSIONS,
            fail_embeddings: false,
            fail_chat_on: None,
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            call_counter: AtomicUsize::new(0),
        }
    }

    /// Reply with `responses` in order before falling back to the keyword script.
    pub fn with_responses(responses: Vec<ChatMessage>) -> Self {
        Self {
            queued: Mutex::new(responses.into()),
            ..Self::new()
        }
    }

    /// Request `name(arguments)` on every chat call.
    pub fn always_calling(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            script: Script::AlwaysCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            ..Self::new()
        }
    }

    /// Every embedding call fails.
    #[must_use]
    pub fn failing_embeddings(mut self) -> Self {
        self.fail_embeddings = true;
        self
    }

    /// The `round`-th chat call (counting from 1) fails.
    #[must_use]
    pub fn failing_chat_on(mut self, round: usize) -> Self {
        self.fail_chat_on = Some(round);
        self
    }

    /// Every chat request received so far.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn chat_calls(&self) -> usize {
        self.requests.lock().await.len()
    }

    fn next_call_id(&self) -> String {
        format!("call_{}", self.call_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn scripted_reply(&self, req: &ChatRequest) -> ChatMessage {
        if let Script::AlwaysCall { name, arguments } = &self.script {
            return ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCall::function(self.next_call_id(), name, arguments)],
            );
        }

        let last = req.messages.last();
        if let Some(last) = last.filter(|m| m.role == MessageRole::Tool) {
            let results: Vec<&str> = req
                .messages
                .iter()
                .rev()
                .take_while(|m| m.role == MessageRole::Tool)
                .map(ChatMessage::text)
                .collect();
            return ChatMessage::assistant(format!(
                "Done ({} tool result{}): {}",
                results.len(),
                if results.len() == 1 { "" } else { "s" },
                last.text()
            ));
        }

        let user_text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(ChatMessage::text)
            .unwrap_or_default();

        if let Some((name, arguments)) = keyword_tool_call(user_text, &req.tools) {
            return ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCall::function(self.next_call_id(), name, arguments.to_string())],
            );
        }

        ChatMessage::assistant(format!("Mock reply: {user_text}"))
    }

    /// Hashed bag-of-words vector, unit length unless the text has no words.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for word in words(text) {
            #[allow(clippy::cast_possible_truncation)]
            let slot = (fnv1a(word.as_bytes()) % self.dimensions as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn offers_tool(tools: &[serde_json::Value], name: &str) -> bool {
    tools
        .iter()
        .any(|t| t["function"]["name"].as_str() == Some(name))
}

fn keyword_tool_call(text: &str, tools: &[serde_json::Value]) -> Option<(&'static str, serde_json::Value)> {
    let lower = text.to_lowercase();

    if ["remember", "save", "store", "write down"].iter().any(|k| lower.contains(k))
        && offers_tool(tools, "upsert_item")
    {
        let kind = if ["buy", "todo", "task"].iter().any(|k| lower.contains(k)) {
            "task"
        } else {
            "note"
        };
        return Some(("upsert_item", serde_json::json!({ "kind": kind, "text": text })));
    }

    if ["find", "search", "recall", "what did", "show me"].iter().any(|k| lower.contains(k))
        && offers_tool(tools, "search")
    {
        return Some(("search", serde_json::json!({ "query": text })));
    }

    None
}

#[allow(clippy::cast_possible_truncation)]
fn estimate_tokens(text: &str) -> u32 {
    text.chars().count().div_ceil(4) as u32
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, req: ChatRequest, cancel: &CancellationToken) -> CoreResult<ChatResponse> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        {
            let mut requests = self.requests.lock().await;
            if self.fail_chat_on == Some(requests.len() + 1) {
                let round = requests.len() + 1;
                requests.push(req);
                return Err(CoreError::CompletionFailed(format!("mock completion failed on round {round}")));
            }
        }

        let queued = self.queued.lock().await.pop_front();
        let message = queued.unwrap_or_else(|| self.scripted_reply(&req));

        let prompt_tokens = req.messages.iter().map(|m| estimate_tokens(m.text())).sum();
        let completion_tokens = estimate_tokens(message.text());
        self.requests.lock().await.push(req);

        Ok(ChatResponse {
            message,
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }

    async fn embed(&self, texts: &[String], cancel: &CancellationToken) -> CoreResult<Vec<Vec<f32>>> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if self.fail_embeddings {
            return Err(CoreError::EmbeddingFailed("mock embeddings disabled".to_string()));
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Vec<ChatMessage>, tools: Vec<serde_json::Value>) -> ChatRequest {
        ChatRequest {
            messages,
            tools,
            tool_choice: None,
            max_tokens: 100,
            temperature: 0.0,
        }
    }

    fn tool_def(name: &str) -> serde_json::Value {
        json!({"type": "function", "function": {"name": name, "parameters": {"type": "object"}}})
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic_and_similar_for_shared_words() {
        let mock = MockProvider::new();
        let token = CancellationToken::new();
        let out = mock
            .embed(
                &["buy milk".to_string(), "buy milk".to_string(), "quantum physics".to_string()],
                &token,
            )
            .await
            .unwrap();
        assert_eq!(out[0], out[1]);
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&out[0], &out[1]) > 0.99);
        assert!(dot(&out[0], &out[2]) < 0.5);
    }

    #[tokio::test]
    async fn test_store_keyword_triggers_upsert_when_offered() {
        let mock = MockProvider::new();
        let res = mock
            .chat(
                request(
                    vec![ChatMessage::user("Remember to buy milk")],
                    vec![tool_def("upsert_item")],
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(res.message.tool_calls[0].function.name, "upsert_item");
        let args: serde_json::Value =
            serde_json::from_str(&res.message.tool_calls[0].function.arguments).unwrap();
        assert_eq!(args["kind"], "task");
    }

    #[tokio::test]
    async fn test_no_tools_means_plain_reply() {
        let mock = MockProvider::new();
        let res = mock
            .chat(request(vec![ChatMessage::user("remember this")], vec![]), &CancellationToken::new())
            .await
            .unwrap();
        assert!(res.message.tool_calls.is_empty());
        assert_eq!(mock.chat_calls().await, 1);
    }

    #[tokio::test]
    async fn test_queued_responses_come_first() {
        let mock = MockProvider::with_responses(vec![ChatMessage::assistant("scripted")]);
        let res = mock
            .chat(request(vec![ChatMessage::user("x")], vec![]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res.message.text(), "scripted");
    }

    #[tokio::test]
    async fn test_chat_fails_on_scripted_round() {
        let mock = MockProvider::new().failing_chat_on(2);
        let token = CancellationToken::new();
        let req = || request(vec![ChatMessage::user("x")], vec![]);

        assert!(mock.chat(req(), &token).await.is_ok());
        assert!(matches!(mock.chat(req(), &token).await, Err(CoreError::CompletionFailed(_))));
        assert!(mock.chat(req(), &token).await.is_ok());
        assert_eq!(mock.chat_calls().await, 3);
    }
}
