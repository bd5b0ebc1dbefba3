//! The per-turn agent loop.
//!
//! A turn moves through `Received → ContextAssembled → {DirectAnswer |
//! ToolLoop} → Answered`:
//!
//! 1. classify the message and, unless disabled, pull memory context;
//! 2. ask the [`ToolGate`] whether capabilities should be offered;
//! 3. either make one plain completion, or loop up to `max_tool_calls`
//!    rounds dispatching every requested call through the registry.
//!
//! Reaching the round bound is a recognised partial outcome
//! ([`TurnStatus::ReachedMaxToolCalls`]), never a silent success.

pub mod intent;
pub mod prompts;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use intent::{DefaultToolGate, Intent, IntentClassifier, KeywordClassifier, ToolGate};
use prompts::PromptContext;

use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatMessage, ChatRequest, LlmProvider, TokenUsage};
use crate::memory::{MemoryHit, MemoryPipeline, SearchOptions};
use crate::telemetry::sanitize_text;
use crate::tools::{CapabilityRegistry, InvocationContext, InvocationResult};

pub const PARTIAL_REPLY: &str =
    "I was able to process your request partially, but reached the maximum number of tool calls allowed.";
pub const MAX_TOOL_CALLS_WARNING: &str = "reached_max_tool_calls";

/// Memory context line used on the direct-answer path.
const DIRECT_CONTEXT_HEADER: &str = "Here's relevant context from your memory:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Upper bound on tool-loop rounds.
    pub max_tool_calls: u32,
    pub enable_rag: bool,
    pub rag_top_k: usize,
    pub rag_min_score: f32,
    /// Token budget for the memory block in the system prompt.
    pub context_tokens: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            temperature: 0.7,
            max_tool_calls: 3,
            enable_rag: true,
            rag_top_k: 5,
            rag_min_score: 0.7,
            context_tokens: 2000,
        }
    }
}

/// One inbound message, already resolved to a tenant and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub tenant_id: String,
    pub user_id: Uuid,
    pub text: String,
}

impl TurnRequest {
    pub fn new(tenant_id: impl Into<String>, user_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Answered,
    ReachedMaxToolCalls,
}

/// Which path produced the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Conversational,
    ToolAssisted,
    ToolAssistedPartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(rename = "type")]
    pub kind: TurnKind,
    pub intent: Intent,
    /// Completion rounds made on the tool path.
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Number of memory hits injected into the prompt.
    pub memory_context: usize,
    #[serde(default)]
    pub tool_results: Vec<InvocationResult>,
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub status: TurnStatus,
    pub metadata: TurnMetadata,
}

/// Transcript and counters owned by one turn.
#[derive(Debug)]
struct TurnState {
    messages: Vec<ChatMessage>,
    iterations: u32,
    tool_results: Vec<InvocationResult>,
    usage: TokenUsage,
}

#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    registry: CapabilityRegistry,
    memory: Option<MemoryPipeline>,
    classifier: Arc<dyn IntentClassifier>,
    gate: Arc<dyn ToolGate>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("capabilities", &self.registry.names())
            .field("memory", &self.memory.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>, registry: CapabilityRegistry, config: OrchestratorConfig) -> Self {
        Self {
            provider,
            registry,
            memory: None,
            classifier: Arc::new(KeywordClassifier::default()),
            gate: Arc::new(DefaultToolGate::default()),
            config,
        }
    }

    #[must_use]
    pub fn with_memory(mut self, pipeline: MemoryPipeline) -> Self {
        self.memory = Some(pipeline);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_tool_gate(mut self, gate: Arc<dyn ToolGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Process one inbound message and produce the reply.
    ///
    /// Memory lookup failures are logged and the turn continues without
    /// context. Completion failures and cancellation abort the turn.
    #[instrument(skip(self, req, cancel), fields(tenant_id = %req.tenant_id, user_id = %req.user_id))]
    pub async fn process_turn(&self, req: &TurnRequest, cancel: &CancellationToken) -> CoreResult<TurnOutcome> {
        let start = Instant::now();
        debug!(message_text = %sanitize_text(&req.text), "orchestrator processing message");

        let intent = self.classifier.classify(&req.text);
        debug!(detected_intent = %intent, "intent detected");

        let hits = self.memory_context(req, cancel).await?;
        let memory_block = match (&self.memory, hits.is_empty()) {
            (Some(pipeline), false) => pipeline.build_context(&hits, Some(self.config.context_tokens)),
            _ => String::new(),
        };

        let use_tools = !self.registry.is_empty() && self.gate.requires_tools(&req.text, intent);

        let prompt_ctx = PromptContext {
            tenant_name: req.tenant_id.clone(),
            user_name: req.user_id.to_string(),
            now: Utc::now(),
            available_tools: if use_tools { self.registry.names() } else { Vec::new() },
        };
        let system = prompts::system_prompt(&prompt_ctx, intent, &memory_block);

        let outcome = if use_tools {
            self.tool_loop(req, intent, system, hits.len(), cancel).await?
        } else {
            self.direct_answer(req, intent, system, &hits, cancel).await?
        };

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            name: "orchestrator.turn.completed",
            tenant_id = %req.tenant_id,
            intent = %intent,
            used_tools = use_tools,
            status = ?outcome.status,
            iterations = outcome.metadata.iterations,
            duration_ms,
            "message processed"
        );
        Ok(outcome)
    }

    async fn memory_context(&self, req: &TurnRequest, cancel: &CancellationToken) -> CoreResult<Vec<MemoryHit>> {
        let Some(pipeline) = self.memory.as_ref().filter(|_| self.config.enable_rag) else {
            return Ok(Vec::new());
        };

        let options = SearchOptions {
            top_k: self.config.rag_top_k,
            min_score: self.config.rag_min_score,
            ..SearchOptions::default()
        };
        match pipeline
            .search(&req.tenant_id, req.user_id, &req.text, Some(options), cancel)
            .await
        {
            Ok(hits) => {
                debug!(memory_items = hits.len(), "memory context loaded");
                Ok(hits)
            }
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(e) => {
                warn!(error = %e, "memory search failed, continuing without context");
                Ok(Vec::new())
            }
        }
    }

    fn request(&self, messages: Vec<ChatMessage>, tools: Vec<serde_json::Value>) -> ChatRequest {
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
        ChatRequest {
            messages,
            tools,
            tool_choice,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    async fn direct_answer(
        &self,
        req: &TurnRequest,
        intent: Intent,
        system: String,
        hits: &[MemoryHit],
        cancel: &CancellationToken,
    ) -> CoreResult<TurnOutcome> {
        let mut messages = vec![ChatMessage::system(system)];
        if !hits.is_empty() {
            let mut context = DIRECT_CONTEXT_HEADER.to_string();
            for hit in hits {
                context.push_str(&format!("\n- {}: {}", hit.kind, hit.text));
            }
            messages.push(ChatMessage::system(context));
        }
        messages.push(ChatMessage::user(req.text.clone()));

        let response = self.provider.chat(self.request(messages, Vec::new()), cancel).await?;

        Ok(TurnOutcome {
            reply: response.message.text().to_string(),
            status: TurnStatus::Answered,
            metadata: TurnMetadata {
                kind: TurnKind::Conversational,
                intent,
                iterations: 1,
                max_iterations: None,
                memory_context: hits.len(),
                tool_results: Vec::new(),
                token_usage: response.usage.unwrap_or_default(),
                warning: None,
            },
        })
    }

    async fn tool_loop(
        &self,
        req: &TurnRequest,
        intent: Intent,
        system: String,
        memory_context: usize,
        cancel: &CancellationToken,
    ) -> CoreResult<TurnOutcome> {
        let tools = self.registry.to_provider_format();
        let ctx = InvocationContext::new(req.tenant_id.clone(), req.user_id, cancel.clone());
        let mut state = TurnState {
            messages: vec![ChatMessage::system(system), ChatMessage::user(req.text.clone())],
            iterations: 0,
            tool_results: Vec::new(),
            usage: TokenUsage::default(),
        };

        while state.iterations < self.config.max_tool_calls {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let response = self
                .provider
                .chat(self.request(state.messages.clone(), tools.clone()), cancel)
                .await?;
            state.iterations += 1;
            if let Some(usage) = &response.usage {
                state.usage.add(usage);
            }

            let message = response.message;
            let calls = message.tool_calls.clone();
            state.messages.push(message.clone());

            if calls.is_empty() {
                return Ok(TurnOutcome {
                    reply: message.text().to_string(),
                    status: TurnStatus::Answered,
                    metadata: TurnMetadata {
                        kind: TurnKind::ToolAssisted,
                        intent,
                        iterations: state.iterations,
                        max_iterations: None,
                        memory_context,
                        tool_results: state.tool_results,
                        token_usage: state.usage,
                        warning: None,
                    },
                });
            }

            for call in calls {
                debug!(tool = %call.function.name, iteration = state.iterations, "dispatching tool call");
                let result = self
                    .registry
                    .dispatch(&ctx, &call.function.name, &call.function.arguments)
                    .await;
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                if !result.success {
                    warn!(
                        tool = %call.function.name,
                        error = result.error.as_deref().unwrap_or_default(),
                        "tool execution failed"
                    );
                }
                state.messages.push(ChatMessage::tool_result(
                    call.id,
                    call.function.name,
                    result.tool_message_content(),
                ));
                state.tool_results.push(result);
            }
        }

        warn!(
            tenant_id = %req.tenant_id,
            max_tool_calls = self.config.max_tool_calls,
            "reached maximum tool call rounds"
        );
        Ok(TurnOutcome {
            reply: PARTIAL_REPLY.to_string(),
            status: TurnStatus::ReachedMaxToolCalls,
            metadata: TurnMetadata {
                kind: TurnKind::ToolAssistedPartial,
                intent,
                iterations: state.iterations,
                max_iterations: Some(self.config.max_tool_calls),
                memory_context,
                tool_results: state.tool_results,
                token_usage: state.usage,
                warning: Some(MAX_TOOL_CALLS_WARNING.to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockProvider, ToolCall};
    use crate::memory::pipeline::MemoryItem;
    use crate::memory::{InMemoryStore, MemoryKind, PipelineConfig};
    use crate::tools::builtin_registry;

    struct Fixture {
        provider: Arc<MockProvider>,
        pipeline: MemoryPipeline,
        orchestrator: Orchestrator,
    }

    fn fixture(provider: MockProvider, config: OrchestratorConfig) -> Fixture {
        let provider = Arc::new(provider);
        let pipeline = MemoryPipeline::new(
            Arc::new(InMemoryStore::new()),
            provider.clone(),
            PipelineConfig::default(),
        );
        let registry = builtin_registry(&pipeline, &serde_json::Map::new()).unwrap();
        let orchestrator = Orchestrator::new(provider.clone(), registry, config).with_memory(pipeline.clone());
        Fixture {
            provider,
            pipeline,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_conversational_turn_offers_no_tools() {
        let f = fixture(MockProvider::new(), OrchestratorConfig::default());
        let outcome = f
            .orchestrator
            .process_turn(&TurnRequest::new("t1", Uuid::new_v4(), "hi there"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Answered);
        assert_eq!(outcome.metadata.kind, TurnKind::Conversational);
        assert_eq!(outcome.reply, "Mock reply: hi there");
        let requests = f.provider.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_empty());
        assert!(requests[0].tool_choice.is_none());
    }

    #[tokio::test]
    async fn test_no_tool_calls_means_one_completion() {
        let provider = MockProvider::with_responses(vec![ChatMessage::assistant("Nothing to store.")]);
        let f = fixture(provider, OrchestratorConfig::default());
        let outcome = f
            .orchestrator
            .process_turn(
                &TurnRequest::new("t1", Uuid::new_v4(), "remember nothing please"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Nothing to store.");
        assert_eq!(outcome.metadata.kind, TurnKind::ToolAssisted);
        assert_eq!(outcome.metadata.iterations, 1);
        let requests = f.provider.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tool_choice.as_deref(), Some("auto"));
        assert!(!requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_tool_loop_stops_at_bound() {
        let provider = MockProvider::always_calling("search", r#"{"query":"milk"}"#);
        let config = OrchestratorConfig {
            max_tool_calls: 3,
            ..OrchestratorConfig::default()
        };
        let f = fixture(provider, config);
        let outcome = f
            .orchestrator
            .process_turn(
                &TurnRequest::new("t1", Uuid::new_v4(), "search my notes for milk"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::ReachedMaxToolCalls);
        assert_eq!(outcome.reply, PARTIAL_REPLY);
        assert_eq!(outcome.metadata.kind, TurnKind::ToolAssistedPartial);
        assert_eq!(outcome.metadata.warning.as_deref(), Some(MAX_TOOL_CALLS_WARNING));
        assert_eq!(outcome.metadata.max_iterations, Some(3));
        assert_eq!(outcome.metadata.tool_results.len(), 3);
        assert_eq!(f.provider.chat_calls().await, 3);
    }

    #[tokio::test]
    async fn test_failed_tool_is_fed_back_not_fatal() {
        let provider = MockProvider::with_responses(vec![
            ChatMessage::assistant_tool_calls(None, vec![ToolCall::function("c1", "get_by_id", "{not json")]),
            ChatMessage::assistant("Sorry, I could not find that."),
        ]);
        let f = fixture(provider, OrchestratorConfig::default());
        let outcome = f
            .orchestrator
            .process_turn(
                &TurnRequest::new("t1", Uuid::new_v4(), "find the item I saved yesterday"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Answered);
        assert_eq!(outcome.metadata.iterations, 2);
        assert!(!outcome.metadata.tool_results[0].success);

        let requests = f.provider.requests().await;
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_msg.text().starts_with("Error: parse failure"));
    }

    #[tokio::test]
    async fn test_completion_failure_after_tool_round_aborts_turn() {
        let provider = MockProvider::always_calling("search", r#"{"query":"milk"}"#).failing_chat_on(2);
        let f = fixture(provider, OrchestratorConfig::default());
        let result = f
            .orchestrator
            .process_turn(
                &TurnRequest::new("t1", Uuid::new_v4(), "search my notes for milk"),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(CoreError::CompletionFailed(_))));
        // the tool from round 1 ran and its result was sent on round 2
        let requests = f.provider.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.last().unwrap().role, crate::llm::MessageRole::Tool);
    }

    #[tokio::test]
    async fn test_memory_is_injected_into_system_prompt() {
        let f = fixture(MockProvider::new(), OrchestratorConfig::default());
        let user = Uuid::new_v4();
        let token = CancellationToken::new();
        f.pipeline
            .store("t1", user, MemoryItem::new(MemoryKind::Task, "buy milk"), &token)
            .await
            .unwrap();

        let outcome = f
            .orchestrator
            .process_turn(&TurnRequest::new("t1", user, "hi buy milk"), &token)
            .await
            .unwrap();
        assert_eq!(outcome.metadata.memory_context, 1);

        let requests = f.provider.requests().await;
        assert!(requests[0].messages[0].text().contains("## Relevant Memory Context"));
        assert!(requests[0].messages[1].text().contains("- task: buy milk"));
    }

    #[tokio::test]
    async fn test_memory_failure_does_not_abort() {
        let provider = Arc::new(MockProvider::new().failing_embeddings());
        let pipeline = MemoryPipeline::new(Arc::new(InMemoryStore::new()), provider.clone(), PipelineConfig::default());
        let orchestrator = Orchestrator::new(provider.clone(), CapabilityRegistry::new(), OrchestratorConfig::default())
            .with_memory(pipeline);

        let outcome = orchestrator
            .process_turn(&TurnRequest::new("t1", Uuid::new_v4(), "hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.metadata.memory_context, 0);
    }

    #[tokio::test]
    async fn test_cancelled_turn_errors() {
        let f = fixture(MockProvider::always_calling("search", r#"{"query":"x"}"#), OrchestratorConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = f
            .orchestrator
            .process_turn(&TurnRequest::new("t1", Uuid::new_v4(), "search for x"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
