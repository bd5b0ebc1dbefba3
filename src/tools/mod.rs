//! Capabilities ("tools") the model can invoke, and the registry that
//! validates and dispatches them.

pub mod http;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod value;

use std::sync::Arc;

pub use registry::{Capability, CapabilityRegistry, InvocationContext, InvocationResult};
pub use schema::{ParameterSchema, PropertySchema, ValueType};
pub use value::{ToolArguments, ToolValue};

use crate::error::CoreResult;
use crate::memory::MemoryPipeline;

/// Names of every built-in capability, in registration order.
pub const BUILTIN_CAPABILITIES: [&str; 6] = [
    "upsert_item",
    "search",
    "get_by_id",
    "update_item",
    "delete_item",
    "call_api",
];

pub fn builtin_capability_names() -> Vec<String> {
    BUILTIN_CAPABILITIES.iter().map(ToString::to_string).collect()
}

/// Build a registry with the built-in capabilities for one tenant.
///
/// `tenant_config` supplies the `services` section read by `call_api`.
pub fn builtin_registry(
    pipeline: &MemoryPipeline,
    tenant_config: &serde_json::Map<String, serde_json::Value>,
) -> CoreResult<CapabilityRegistry> {
    CapabilityRegistry::new()
        .with(Arc::new(memory::UpsertItem::new(pipeline.clone())))?
        .with(Arc::new(memory::SearchMemory::new(pipeline.clone())))?
        .with(Arc::new(memory::GetById::new(pipeline.clone())))?
        .with(Arc::new(memory::UpdateItem::new(pipeline.clone())))?
        .with(Arc::new(memory::DeleteItem::new(pipeline.clone())))?
        .with(Arc::new(http::CallApi::from_tenant_config(tenant_config)?))
}
