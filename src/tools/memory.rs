//! Memory capabilities offered to the model: create, search, fetch, update
//! and delete the current user's memory items.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::registry::{Capability, InvocationContext, required_str};
use super::schema::{ParameterSchema, PropertySchema};
use super::value::{ToolArguments, string_list};
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::memory::pipeline::MemoryItem;
use crate::memory::{MemoryKind, MemoryPipeline, MemoryUpdate, Metadata, SearchFilter, SearchOptions};

/// Minimum similarity for the `search` capability.
pub const SEARCH_MIN_SCORE: f32 = 0.7;
pub const SEARCH_DEFAULT_TOP_K: i64 = 5;
pub const SEARCH_MAX_TOP_K: i64 = 20;

fn parse_kind(field: &str, raw: &str) -> CoreResult<MemoryKind> {
    MemoryKind::from_str(raw).map_err(|_| {
        CoreError::Validation(ValidationError::InvalidEnumValue {
            field: field.to_string(),
            allowed: MemoryKind::WIRE_NAMES.iter().map(ToString::to_string).collect(),
        })
    })
}

fn parse_id(args: &ToolArguments) -> CoreResult<Uuid> {
    let raw = required_str(args, "id")?;
    Uuid::parse_str(raw).map_err(|e| {
        CoreError::Validation(ValidationError::InvalidFormat {
            field: "id".to_string(),
            reason: e.to_string(),
        })
    })
}

/// RFC 3339 check for `when` values.
fn check_timestamp(field: &str, raw: &str) -> CoreResult<()> {
    DateTime::parse_from_rfc3339(raw).map(|_| ()).map_err(|e| {
        CoreError::Validation(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("use an ISO8601 timestamp: {e}"),
        })
    })
}

fn kind_schema() -> PropertySchema {
    PropertySchema::string()
        .describe("Type of memory item: note, event, task, or msg")
        .one_of(&MemoryKind::WIRE_NAMES)
}

fn tags_schema(description: &str) -> PropertySchema {
    PropertySchema::array(PropertySchema::string()).describe(description)
}

#[derive(Debug, Clone)]
pub struct UpsertItem {
    pipeline: MemoryPipeline,
}

impl UpsertItem {
    pub fn new(pipeline: MemoryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Capability for UpsertItem {
    fn name(&self) -> &str {
        "upsert_item"
    }

    fn description(&self) -> &str {
        "Store a note, event, task or message in the user's long-term memory."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required("kind", kind_schema())
            .required("text", PropertySchema::string().describe("The content text of the memory item"))
            .optional(
                "when",
                PropertySchema::string().describe("ISO8601 timestamp for events/tasks (optional)"),
            )
            .optional("tags", tags_schema("Tags to categorize the item (optional)"))
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let kind = parse_kind("kind", required_str(&args, "kind")?)?;
        let text = required_str(&args, "text")?.to_string();
        let when = args.get_str("when").filter(|w| !w.is_empty()).map(ToString::to_string);
        let tags = args.get_str_list("tags");

        let mut metadata = Metadata::new();
        metadata.insert(
            "created_at".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true).into(),
        );
        if let Some(when) = &when {
            check_timestamp("when", when)?;
            metadata.insert("when".into(), json!(when));
        }
        if !tags.is_empty() {
            metadata.insert("tags".into(), json!(tags));
        }

        let item = MemoryItem {
            kind,
            text: text.clone(),
            metadata,
        };
        let id = self
            .pipeline
            .store(&ctx.tenant_id, ctx.user_id, item, &ctx.cancel)
            .await?;

        info!(
            tenant_id = %ctx.tenant_id,
            user_id = %ctx.user_id,
            kind = %kind,
            id = %id,
            "memory item stored via capability"
        );

        Ok(json!({
            "id": id.to_string(),
            "status": "stored",
            "kind": kind,
            "text": text,
            "when": when.unwrap_or_default(),
            "tags": tags,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SearchMemory {
    pipeline: MemoryPipeline,
}

impl SearchMemory {
    pub fn new(pipeline: MemoryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Capability for SearchMemory {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the user's long-term memory for relevant items."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required(
                "query",
                PropertySchema::string().describe("Search query to find relevant memory items"),
            )
            .optional(
                "top_k",
                PropertySchema::integer().describe("Number of results to return (default: 5, max: 20)"),
            )
            .optional(
                "filter",
                PropertySchema::object()
                    .describe("Optional filters to apply")
                    .property(
                        "kind",
                        PropertySchema::array(kind_schema()).describe("Filter by memory item types"),
                    )
                    .property("tags", tags_schema("Filter by tags")),
            )
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let query = required_str(&args, "query")?;
        let top_k = args
            .get_i64("top_k")
            .unwrap_or(SEARCH_DEFAULT_TOP_K)
            .clamp(1, SEARCH_MAX_TOP_K);

        let mut filter = SearchFilter::default();
        let filter_given = args.get_object("filter").is_some();
        if let Some(raw) = args.get_object("filter") {
            for kind in string_list(raw.get("kind")) {
                filter.kinds.push(parse_kind("filter.kind", &kind)?);
            }
            filter.tags = string_list(raw.get("tags"));
        }

        let options = SearchOptions {
            top_k: usize::try_from(top_k).unwrap_or(5),
            min_score: SEARCH_MIN_SCORE,
            filter: filter.clone(),
            query_text: Some(query.to_string()),
        };
        let hits = self
            .pipeline
            .search(&ctx.tenant_id, ctx.user_id, query, Some(options), &ctx.cancel)
            .await?;

        let items: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "id": hit.id.to_string(),
                    "kind": hit.kind,
                    "text": hit.text,
                    "score": hit.score,
                    "metadata": hit.metadata,
                })
            })
            .collect();

        let filter_json = if filter_given {
            json!({ "kind": filter.kinds, "tags": filter.tags })
        } else {
            serde_json::Value::Null
        };

        Ok(json!({
            "items": items,
            "query": query,
            "total_found": hits.len(),
            "search_options": {
                "top_k": top_k,
                "min_score": SEARCH_MIN_SCORE,
                "filter": filter_json,
            },
        }))
    }
}

#[derive(Debug, Clone)]
pub struct GetById {
    pipeline: MemoryPipeline,
}

impl GetById {
    pub fn new(pipeline: MemoryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Capability for GetById {
    fn name(&self) -> &str {
        "get_by_id"
    }

    fn description(&self) -> &str {
        "Fetch one memory item by its id."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new().required(
            "id",
            PropertySchema::string().describe("UUID of the memory item to retrieve"),
        )
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let raw_id = required_str(&args, "id")?.to_string();
        let id = parse_id(&args)?;

        match self.pipeline.get(&ctx.tenant_id, ctx.user_id, id, &ctx.cancel).await {
            Ok(record) => Ok(json!({
                "found": true,
                "id": record.id.to_string(),
                "kind": record.kind,
                "text": record.text,
                "metadata": record.metadata,
                "created_at": record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                "updated_at": record.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            })),
            Err(CoreError::NotFound { .. }) => Ok(json!({ "found": false, "id": raw_id })),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateItem {
    pipeline: MemoryPipeline,
}

impl UpdateItem {
    pub fn new(pipeline: MemoryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Capability for UpdateItem {
    fn name(&self) -> &str {
        "update_item"
    }

    fn description(&self) -> &str {
        "Change the text, time or tags of an existing memory item."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required("id", PropertySchema::string().describe("UUID of the memory item to update"))
            .required(
                "updates",
                PropertySchema::object()
                    .describe("Fields to update")
                    .property("text", PropertySchema::string().describe("Update the text content"))
                    .property("when", PropertySchema::string().describe("Update the timestamp (ISO8601)"))
                    .property("tags", tags_schema("Update the tags")),
            )
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let id = parse_id(&args)?;
        let updates = args.get_object("updates").cloned().unwrap_or_default();
        if updates.is_empty() {
            return Err(CoreError::Validation(ValidationError::InvalidFormat {
                field: "updates".to_string(),
                reason: "no updates provided".to_string(),
            }));
        }

        let when = updates.get("when").and_then(|v| v.as_str()).map(ToString::to_string);
        if let Some(when) = &when {
            check_timestamp("updates.when", when)?;
        }
        let tags = updates.get("tags").map(|v| string_list(Some(v)));

        let mut update = MemoryUpdate {
            text: updates.get("text").and_then(|v| v.as_str()).map(ToString::to_string),
            ..MemoryUpdate::default()
        };

        if when.is_some() || tags.is_some() {
            let existing = self.pipeline.get(&ctx.tenant_id, ctx.user_id, id, &ctx.cancel).await?;
            let mut metadata = existing.metadata;
            if let Some(when) = when {
                metadata.insert("when".into(), json!(when));
            }
            if let Some(tags) = tags {
                metadata.insert("tags".into(), json!(tags));
            }
            metadata.insert(
                "updated_at".into(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true).into(),
            );
            update.metadata = Some(metadata);
        }

        self.pipeline
            .update(&ctx.tenant_id, ctx.user_id, id, update, &ctx.cancel)
            .await?;

        info!(tenant_id = %ctx.tenant_id, id = %id, "memory item updated via capability");

        let updates_json: serde_json::Map<String, serde_json::Value> =
            updates.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        Ok(json!({ "ok": true, "id": id.to_string(), "updates": updates_json }))
    }
}

#[derive(Debug, Clone)]
pub struct DeleteItem {
    pipeline: MemoryPipeline,
}

impl DeleteItem {
    pub fn new(pipeline: MemoryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Capability for DeleteItem {
    fn name(&self) -> &str {
        "delete_item"
    }

    fn description(&self) -> &str {
        "Delete a memory item by its id."
    }

    fn schema(&self) -> ParameterSchema {
        ParameterSchema::new().required(
            "id",
            PropertySchema::string().describe("UUID of the memory item to delete"),
        )
    }

    async fn invoke(&self, ctx: &InvocationContext, args: ToolArguments) -> CoreResult<serde_json::Value> {
        let id = parse_id(&args)?;
        self.pipeline
            .delete(&ctx.tenant_id, ctx.user_id, id, &ctx.cancel)
            .await?;
        info!(tenant_id = %ctx.tenant_id, id = %id, "memory item deleted via capability");
        Ok(json!({ "ok": true, "id": id.to_string(), "deleted": true }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::MockProvider;
    use crate::memory::{InMemoryStore, PipelineConfig};
    use crate::tools::registry::CapabilityRegistry;
    use tokio_util::sync::CancellationToken;

    fn registry() -> (CapabilityRegistry, InvocationContext) {
        let pipeline = MemoryPipeline::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockProvider::new()),
            PipelineConfig::default(),
        );
        let registry = CapabilityRegistry::new()
            .with(Arc::new(UpsertItem::new(pipeline.clone())))
            .and_then(|r| r.with(Arc::new(SearchMemory::new(pipeline.clone()))))
            .and_then(|r| r.with(Arc::new(GetById::new(pipeline.clone()))))
            .and_then(|r| r.with(Arc::new(UpdateItem::new(pipeline.clone()))))
            .and_then(|r| r.with(Arc::new(DeleteItem::new(pipeline))))
            .unwrap();
        let ctx = InvocationContext::new("tenant_a", Uuid::new_v4(), CancellationToken::new());
        (registry, ctx)
    }

    #[tokio::test]
    async fn test_upsert_then_get() {
        let (registry, ctx) = registry();
        let stored = registry
            .dispatch(&ctx, "upsert_item", r#"{"kind":"task","text":"buy milk","tags":["home"]}"#)
            .await;
        assert!(stored.success, "{stored:?}");
        let stored = stored.result.unwrap();
        assert_eq!(stored["status"], "stored");
        assert_eq!(stored["kind"], "task");

        let id = stored["id"].as_str().unwrap();
        let fetched = registry
            .dispatch(&ctx, "get_by_id", &json!({ "id": id }).to_string())
            .await
            .result
            .unwrap();
        assert_eq!(fetched["found"], true);
        assert_eq!(fetched["text"], "buy milk");
        assert_eq!(fetched["metadata"]["tags"], json!(["home"]));
    }

    #[tokio::test]
    async fn test_get_missing_id_reports_not_found() {
        let (registry, ctx) = registry();
        let id = Uuid::new_v4().to_string();
        let result = registry
            .dispatch(&ctx, "get_by_id", &json!({ "id": id }).to_string())
            .await;
        assert!(result.success);
        assert_eq!(result.result.unwrap(), json!({ "found": false, "id": id }));
    }

    #[tokio::test]
    async fn test_bad_kind_and_timestamp_fail_softly() {
        let (registry, ctx) = registry();
        let bad_kind = registry
            .dispatch(&ctx, "upsert_item", r#"{"kind":"memo","text":"x"}"#)
            .await;
        assert!(!bad_kind.success);
        assert!(bad_kind.error.unwrap().contains("must be one of"));

        let bad_when = registry
            .dispatch(&ctx, "upsert_item", r#"{"kind":"event","text":"x","when":"next tuesday"}"#)
            .await;
        assert!(!bad_when.success);
        assert!(bad_when.error.unwrap().contains("when"));
    }

    #[tokio::test]
    async fn test_search_reports_options() {
        let (registry, ctx) = registry();
        registry
            .dispatch(&ctx, "upsert_item", r#"{"kind":"task","text":"buy milk"}"#)
            .await;

        let result = registry
            .dispatch(&ctx, "search", r#"{"query":"buy milk","top_k":50,"filter":{"kind":["task"]}}"#)
            .await
            .result
            .unwrap();
        assert_eq!(result["total_found"], 1);
        assert_eq!(result["items"][0]["text"], "buy milk");
        assert_eq!(result["search_options"]["top_k"], 20);
        assert_eq!(result["search_options"]["filter"]["kind"], json!(["task"]));
    }

    #[tokio::test]
    async fn test_update_merges_metadata_and_delete_removes() {
        let (registry, ctx) = registry();
        let stored = registry
            .dispatch(&ctx, "upsert_item", r#"{"kind":"note","text":"dentist friday","tags":["health"]}"#)
            .await
            .result
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        let updated = registry
            .dispatch(
                &ctx,
                "update_item",
                &json!({ "id": id, "updates": { "text": "dentist monday", "when": "2025-01-06T09:00:00Z" } })
                    .to_string(),
            )
            .await;
        assert!(updated.success, "{updated:?}");

        let fetched = registry
            .dispatch(&ctx, "get_by_id", &json!({ "id": id }).to_string())
            .await
            .result
            .unwrap();
        assert_eq!(fetched["text"], "dentist monday");
        assert_eq!(fetched["metadata"]["when"], "2025-01-06T09:00:00Z");
        assert_eq!(fetched["metadata"]["tags"], json!(["health"]));

        let deleted = registry
            .dispatch(&ctx, "delete_item", &json!({ "id": id }).to_string())
            .await;
        assert!(deleted.success);
        let gone = registry
            .dispatch(&ctx, "get_by_id", &json!({ "id": id }).to_string())
            .await
            .result
            .unwrap();
        assert_eq!(gone["found"], false);
    }

    #[tokio::test]
    async fn test_update_requires_some_field() {
        let (registry, ctx) = registry();
        let result = registry
            .dispatch(
                &ctx,
                "update_item",
                &json!({ "id": Uuid::new_v4().to_string(), "updates": {} }).to_string(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no updates provided"));
    }
}
