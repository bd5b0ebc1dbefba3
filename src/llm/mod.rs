//! Chat-completion and embedding collaborators.
//!
//! The orchestrator and the memory pipeline only see the [`LlmProvider`]
//! trait. Concrete backends form a closed set chosen once per tenant from a
//! [`ProviderKind`]:
//!
//! - [`ChatCompletionsProvider`]: any `OpenAI`-compatible `/chat/completions`
//!   and `/embeddings` endpoint (`OpenAI`, Azure, `OpenRouter`, Together, Groq,
//!   `DeepSeek`, generic).
//! - [`MockProvider`]: deterministic, offline; used for development and tests.
//!
//! Embedding models named `local:<model>` are computed in-process by
//! [`LocalEmbedder`].

pub mod chat_completions;
pub mod local;
pub mod mock;
pub mod provider;

use std::sync::Arc;

pub use chat_completions::ChatCompletionsProvider;
pub use local::LocalEmbedder;
pub use mock::MockProvider;
pub use provider::ProviderKind;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CoreResult;

/// Connection and model settings for one provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Backend family.
    #[serde(alias = "provider")]
    pub kind: ProviderKind,
    /// Base URL; the kind's default is used when empty.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model_chat: String,
    pub model_embed: String,
    /// Azure deployment name.
    #[serde(default)]
    pub deployment_name: Option<String>,
    /// Azure API version.
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAI,
            base_url: None,
            api_key: None,
            model_chat: provider::DEFAULT_CHAT_MODEL.to_string(),
            model_embed: provider::DEFAULT_EMBEDDING_MODEL.to_string(),
            deployment_name: None,
            api_version: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl LlmSettings {
    /// The configured base URL, or the kind's default.
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map_or_else(|| self.kind.default_base_url().to_string(), ToString::to_string)
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of a turn transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    /// Text content; `None` on assistant messages that only carry tool calls.
    #[serde(default)]
    pub content: Option<String>,
    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the call a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    /// An assistant message asking for tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// A tool-result message keyed by the originating call id.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

fn function_call_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as an opaque JSON string.
    pub arguments: String,
}

/// Input of one chat-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tool definitions in chat-completion function format; empty for none.
    pub tools: Vec<serde_json::Value>,
    /// `"auto"` when tools are offered.
    pub tool_choice: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Output of one chat-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub usage: Option<TokenUsage>,
}

/// A chat-completion plus embedding backend.
///
/// Every call takes the caller's cancellation token; a fired token surfaces
/// as [`CoreError::Cancelled`](crate::error::CoreError::Cancelled).
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// One non-streaming chat completion.
    async fn chat(&self, req: ChatRequest, cancel: &CancellationToken) -> CoreResult<ChatResponse>;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String], cancel: &CancellationToken) -> CoreResult<Vec<Vec<f32>>>;
}

/// Build the provider for one set of settings.
pub fn build_provider(settings: &LlmSettings) -> CoreResult<Arc<dyn LlmProvider>> {
    match settings.kind {
        ProviderKind::Mock => Ok(Arc::new(MockProvider::new())),
        _ => Ok(Arc::new(ChatCompletionsProvider::new(settings.clone())?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_message_serialization() {
        let msg = ChatMessage::tool_result("call_1", "search", "{\"items\":[]}");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert_eq!(value["name"], "search");
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn test_assistant_tool_calls_deserialize_with_null_content() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "search", "arguments": "{}"}}]
        }))
        .unwrap();
        assert_eq!(msg.text(), "");
        assert_eq!(msg.tool_calls[0].function.name, "search");
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.add(&TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
        });
        assert_eq!(total.total_tokens, 17);
    }

    #[test]
    fn test_effective_base_url_defaults_by_kind() {
        let settings = LlmSettings {
            kind: ProviderKind::DeepSeek,
            ..LlmSettings::default()
        };
        assert_eq!(settings.effective_base_url(), "https://api.deepseek.com/v1");
    }
}
