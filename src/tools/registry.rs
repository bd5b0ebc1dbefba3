use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::schema::ParameterSchema;
use super::value::ToolArguments;
use crate::error::{CoreError, CoreResult, ValidationError, cancellable};

/// Who a capability is acting for, plus the turn's cancellation signal.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub tenant_id: String,
    pub user_id: Uuid,
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(tenant_id: impl Into<String>, user_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id,
            cancel,
        }
    }
}

/// A named, schema-described function the model may ask to invoke.
#[async_trait]
pub trait Capability: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> ParameterSchema;
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        args: ToolArguments,
    ) -> CoreResult<serde_json::Value>;
}

/// Outcome of one dispatch. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn ok(tool_name: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Content of the `tool` message fed back to the model.
    pub fn tool_message_content(&self) -> String {
        if self.success {
            match &self.result {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => "null".to_string(),
            }
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

#[derive(Clone)]
struct Registered {
    capability: Arc<dyn Capability>,
    schema: ParameterSchema,
}

/// Holds the capabilities available to one process or tenant scope.
///
/// Constructed explicitly and passed down; there is no global default.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Registered>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability; its schema is captured once here.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> CoreResult<()> {
        let name = capability.name().to_string();
        if !is_valid_tool_name(&name) {
            return Err(CoreError::Config(format!(
                "capability name '{name}' must match ^[a-zA-Z0-9_-]+$"
            )));
        }
        if self.entries.contains_key(&name) {
            return Err(CoreError::DuplicateCapability(name));
        }

        let schema = capability.schema();
        debug!(capability = %name, "capability registered");
        self.entries.insert(name, Registered { capability, schema });
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, capability: Arc<dyn Capability>) -> CoreResult<Self> {
        self.register(capability)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> CoreResult<Arc<dyn Capability>> {
        self.entries
            .get(name)
            .map(|entry| Arc::clone(&entry.capability))
            .ok_or_else(|| CoreError::not_found("capability", name))
    }

    pub fn list_all(&self) -> Vec<Arc<dyn Capability>> {
        self.entries
            .values()
            .map(|entry| Arc::clone(&entry.capability))
            .collect()
    }

    /// Capabilities visible to a tenant.
    ///
    /// Which capabilities a tenant may use is the tenant manager's decision; when
    /// it passes no enabled list this is the full set.
    pub fn list_for_tenant(
        &self,
        _tenant_id: &str,
        enabled: Option<&[String]>,
    ) -> Vec<Arc<dyn Capability>> {
        match enabled {
            Some(enabled) => self
                .entries
                .iter()
                .filter(|(name, _)| enabled.iter().any(|e| e == *name))
                .map(|(_, entry)| Arc::clone(&entry.capability))
                .collect(),
            None => self.list_all(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A registry restricted to the given capability names.
    pub fn restricted_to(&self, enabled: &[String]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| enabled.iter().any(|e| e == *name))
                .map(|(name, entry)| (name.clone(), entry.clone()))
                .collect(),
        }
    }

    pub fn validate_arguments(&self, name: &str, args: &ToolArguments) -> CoreResult<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CoreError::not_found("capability", name))?;
        entry.schema.validate(args).map_err(CoreError::from)
    }

    /// Parse, validate and invoke one model tool call.
    ///
    /// Every failure, including a malformed argument blob, comes back as an
    /// unsuccessful [`InvocationResult`] rather than an error.
    #[instrument(skip(self, ctx, raw_arguments), fields(tenant_id = %ctx.tenant_id))]
    pub async fn dispatch(
        &self,
        ctx: &InvocationContext,
        name: &str,
        raw_arguments: &str,
    ) -> InvocationResult {
        let args = match ToolArguments::parse(raw_arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %name, error = %e, "tool arguments could not be parsed");
                return InvocationResult::failed(name, e);
            }
        };

        let entry = match self.entries.get(name) {
            Some(entry) => entry,
            None => {
                warn!(tool = %name, "unknown tool requested");
                return InvocationResult::failed(name, CoreError::not_found("capability", name).to_string());
            }
        };

        if let Err(e) = entry.schema.validate(&args) {
            debug!(tool = %name, error = %e, "tool arguments rejected");
            return InvocationResult::failed(name, CoreError::Validation(e).to_string());
        }

        match cancellable(&ctx.cancel, entry.capability.invoke(ctx, args)).await {
            Ok(value) => {
                debug!(tool = %name, "tool invocation succeeded");
                InvocationResult::ok(name, value)
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "tool invocation failed");
                InvocationResult::failed(name, e.to_string())
            }
        }
    }

    /// Render every schema as a chat-completion function tool definition.
    pub fn to_provider_format(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .map(|(name, entry)| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": entry.capability.description(),
                        "parameters": entry.schema.to_json(),
                    }
                })
            })
            .collect()
    }
}

/// `OpenAI` requires tool names matching `^[a-zA-Z0-9_-]+$`.
fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Convenience for capabilities: fetch a required string argument.
pub fn required_str<'a>(args: &'a ToolArguments, field: &str) -> CoreResult<&'a str> {
    args.get_str(field).ok_or_else(|| {
        CoreError::Validation(ValidationError::MissingRequiredField {
            field: field.to_string(),
        })
    })
}
