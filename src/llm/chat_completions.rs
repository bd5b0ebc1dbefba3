//! `OpenAI` Chat Completions provider.
//!
//! Implements [`LlmProvider`] against `/chat/completions` and `/embeddings`
//! for every OpenAI-compatible backend. Requests are non-streaming: the
//! orchestrator needs the complete assistant message, tool calls included,
//! before it can dispatch anything.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::local::{LOCAL_MODEL_PREFIX, LocalEmbedder};
use super::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, LlmSettings, ProviderKind, TokenUsage};
use crate::error::{CoreError, CoreResult, cancellable};

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingBody {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Provider for OpenAI-compatible chat completion APIs.
#[derive(Clone)]
pub struct ChatCompletionsProvider {
    http: reqwest::Client,
    settings: LlmSettings,
    chat_url: String,
    embeddings_url: String,
    local: Option<Arc<LocalEmbedder>>,
}

impl std::fmt::Debug for ChatCompletionsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsProvider")
            .field("kind", &self.settings.kind)
            .field("chat_url", &self.chat_url)
            .field("model_chat", &self.settings.model_chat)
            .field("model_embed", &self.settings.model_embed)
            .field("local_embeddings", &self.local.is_some())
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsProvider {
    pub fn new(settings: LlmSettings) -> CoreResult<Self> {
        if settings.kind == ProviderKind::Azure && settings.deployment_name.is_none() {
            return Err(CoreError::Config(
                "azure provider requires a deployment_name".to_string(),
            ));
        }

        let base_url = settings.effective_base_url();
        if base_url.is_empty() {
            return Err(CoreError::Config(format!(
                "provider '{}' requires a base_url",
                settings.kind
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::Config(format!("http client: {e}")))?;

        let deployment = settings.deployment_name.as_deref();
        let version = settings.api_version.as_deref();
        let chat_url = settings.kind.build_chat_url(&base_url, deployment, version);
        let embeddings_url = settings
            .kind
            .build_embeddings_url(&base_url, deployment, version);

        let local = settings
            .model_embed
            .strip_prefix(LOCAL_MODEL_PREFIX)
            .map(|model| LocalEmbedder::new(model).map(Arc::new))
            .transpose()?;

        Ok(Self {
            http,
            settings,
            chat_url,
            embeddings_url,
            local,
        })
    }

    fn authorize(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.settings.api_key, self.settings.kind) {
            (Some(key), ProviderKind::Azure) => rb.header("api-key", key),
            (Some(key), _) => rb.bearer_auth(key),
            (None, _) => rb,
        }
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<String, String> {
        let resp = self
            .authorize(self.http.post(url).json(body))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("{status}: {text}"));
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl LlmProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        self.settings.kind.as_str()
    }

    #[instrument(skip_all, fields(provider = %self.settings.kind, model = %self.settings.model_chat))]
    async fn chat(&self, req: ChatRequest, cancel: &CancellationToken) -> CoreResult<ChatResponse> {
        let mut body = serde_json::json!({
            "model": self.settings.model_chat,
            "messages": req.messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if !req.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(req.tools);
            if let Some(choice) = req.tool_choice {
                body["tool_choice"] = serde_json::Value::String(choice);
            }
        }

        debug!(message_count = body["messages"].as_array().map_or(0, Vec::len), "Sending chat completion request");

        let text = cancellable(cancel, async {
            self.post_json(&self.chat_url, &body)
                .await
                .map_err(CoreError::CompletionFailed)
        })
        .await?;

        let parsed: CompletionBody = serde_json::from_str(&text)
            .map_err(|e| CoreError::CompletionFailed(format!("invalid response body: {e}")))?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| CoreError::CompletionFailed("no choices returned".to_string()))?;

        debug!(
            tool_calls = message.tool_calls.len(),
            total_tokens = parsed.usage.map_or(0, |u| u.total_tokens),
            "Chat completion received"
        );

        Ok(ChatResponse {
            message,
            usage: parsed.usage,
        })
    }

    #[instrument(skip_all, fields(provider = %self.settings.kind, count = texts.len()))]
    async fn embed(&self, texts: &[String], cancel: &CancellationToken) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(local) = &self.local {
            return cancellable(cancel, local.embed(texts.to_vec())).await;
        }

        let body = serde_json::json!({
            "model": self.settings.model_embed,
            "input": texts,
        });

        let text = cancellable(cancel, async {
            self.post_json(&self.embeddings_url, &body)
                .await
                .map_err(CoreError::EmbeddingFailed)
        })
        .await?;

        let mut parsed: EmbeddingBody = serde_json::from_str(&text)
            .map_err(|e| CoreError::EmbeddingFailed(format!("invalid response body: {e}")))?;

        if parsed.data.len() != texts.len() {
            warn!(expected = texts.len(), got = parsed.data.len(), "Embedding count mismatch");
            return Err(CoreError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_azure_requires_deployment() {
        let settings = LlmSettings {
            kind: ProviderKind::Azure,
            base_url: Some("https://x.openai.azure.com".to_string()),
            ..LlmSettings::default()
        };
        assert!(matches!(
            ChatCompletionsProvider::new(settings),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_urls_follow_kind() {
        let provider = ChatCompletionsProvider::new(LlmSettings {
            kind: ProviderKind::DeepSeek,
            ..LlmSettings::default()
        })
        .unwrap();
        assert_eq!(provider.chat_url, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(provider.embeddings_url, "https://api.deepseek.com/v1/embeddings");
        assert_eq!(provider.name(), "deepseek");
    }

    #[test]
    fn test_completion_body_parses_tool_calls() {
        let body: CompletionBody = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null,
                "tool_calls":[{"id":"call_1","type":"function","function":{"name":"search","arguments":"{\"query\":\"milk\"}"}}]}}],
                "usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#,
        )
        .unwrap();
        assert_eq!(body.choices[0].message.tool_calls[0].id, "call_1");
        assert_eq!(body.usage.unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn test_empty_embed_input_skips_request() {
        let provider = ChatCompletionsProvider::new(LlmSettings {
            base_url: Some("http://127.0.0.1:9".to_string()),
            ..LlmSettings::default()
        })
        .unwrap();
        let out = provider.embed(&[], &CancellationToken::new()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_chat_returns_cancelled() {
        let provider = ChatCompletionsProvider::new(LlmSettings {
            base_url: Some("http://10.255.255.1:81".to_string()),
            ..LlmSettings::default()
        })
        .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: 10,
            temperature: 0.0,
        };
        assert!(matches!(provider.chat(req, &token).await, Err(CoreError::Cancelled)));
    }
}
