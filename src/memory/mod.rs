//! Long-term memory: domain types, the [`MemoryStore`] contract and its
//! backends, and the [`MemoryPipeline`] that sits in front of them.
//!
//! # Backends
//!
//! - [`PgVectorStore`]: ranks by `1 - cosine_distance`, scores in `[0, 1]`.
//! - [`LexicalStore`]: Postgres full-text rank with an `ILIKE` fallback, for
//!   deployments without the `vector` extension. Its scores are ad hoc
//!   relevance ranks, **not** comparable to cosine similarity, and relevance
//!   is best-effort only.
//! - [`InMemoryStore`]: cosine similarity computed in process.
//!
//! [`MemoryStore::backend`] tells callers which scale a score is on.

pub mod context;
pub mod in_memory;
pub mod lexical;
pub mod pgvector_store;
pub mod pipeline;
pub mod rerank;
mod sql;

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use in_memory::InMemoryStore;
pub use lexical::LexicalStore;
pub use pgvector_store::PgVectorStore;
pub use pipeline::{MemoryPipeline, PipelineConfig};

use crate::error::{CoreError, CoreResult};

/// Free-form record metadata (tags, timestamps, chunk bookkeeping).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// What a memory record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "task")]
    Task,
    #[serde(rename = "msg", alias = "message")]
    Message,
}

impl MemoryKind {
    /// Wire names accepted by the built-in capabilities.
    pub const WIRE_NAMES: [&'static str; 4] = ["note", "event", "task", "msg"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Event => "event",
            Self::Task => "task",
            Self::Message => "msg",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "event" => Ok(Self::Event),
            "task" => Ok(Self::Task),
            "msg" | "message" => Ok(Self::Message),
            other => Err(CoreError::StorageUnavailable(format!(
                "unknown memory kind in storage: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record to be written. The store assigns an id when none is given.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub id: Option<Uuid>,
    pub kind: MemoryKind,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// A stored record, owned by exactly one (tenant, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Uuid,
    pub kind: MemoryKind,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One search result. Scores are only comparable within one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub id: Uuid,
    pub kind: MemoryKind,
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Kind set membership; empty means any kind.
    pub kinds: Vec<MemoryKind>,
    /// Tag overlap with `metadata.tags`; empty means no tag constraint.
    pub tags: Vec<String>,
    /// Exact string equality on top-level metadata keys.
    pub meta: BTreeMap<String, String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && self.tags.is_empty() && self.meta.is_empty()
    }

    /// Whether a record's kind and metadata pass this filter.
    pub fn matches(&self, kind: MemoryKind, metadata: &Metadata) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&kind) {
            return false;
        }
        if !self.tags.is_empty() {
            let tags = metadata_tags(metadata);
            if !self.tags.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        self.meta.iter().all(|(key, expected)| {
            metadata
                .get(key)
                .is_some_and(|v| metadata_value_text(v) == *expected)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Floor on the backend's own score scale; `0.0` disables it.
    pub min_score: f32,
    pub filter: SearchFilter,
    /// The query as text, for backends that cannot rank by embedding.
    pub query_text: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
            filter: SearchFilter::default(),
            query_text: None,
        }
    }
}

/// Partial update. Only `Some` fields are written; the store never
/// re-embeds on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryUpdate {
    pub text: Option<String>,
    pub kind: Option<MemoryKind>,
    pub metadata: Option<Metadata>,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.kind.is_none() && self.metadata.is_none() && self.embedding.is_none()
    }
}

/// Storage selector from tenant configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackend {
    #[serde(rename = "pgvector")]
    PgVector,
    SqlFallback,
    InMemory,
}

impl MemoryBackend {
    pub const NAMES: [&'static str; 3] = ["pgvector", "sql_fallback", "in_memory"];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PgVector => "pgvector",
            Self::SqlFallback => "sql_fallback",
            Self::InMemory => "in_memory",
        }
    }

    /// Parse a selector; unrecognised names select the vector backend.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "sql_fallback" | "sqlfallback" | "lexical" => Self::SqlFallback,
            "in_memory" | "memory" => Self::InMemory,
            _ => Self::PgVector,
        }
    }

    /// Whether this backend needs a database connection.
    pub fn needs_database(self) -> bool {
        !matches!(self, Self::InMemory)
    }
}

impl std::fmt::Display for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence of memory records for many tenants and users.
#[async_trait]
pub trait MemoryStore: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> MemoryBackend;

    async fn upsert(&self, tenant_id: &str, user_id: Uuid, records: Vec<NewMemory>) -> CoreResult<Vec<Uuid>>;

    async fn search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        query_embedding: &[f32],
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>>;

    async fn get_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<MemoryRecord>;

    async fn update_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid, update: MemoryUpdate) -> CoreResult<()>;

    async fn delete_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<()>;

    /// Release connections. Safe to call more than once.
    async fn close(&self) -> CoreResult<()>;
}

/// String tags stored under `metadata.tags`.
pub fn metadata_tags(metadata: &Metadata) -> Vec<String> {
    metadata
        .get("tags")
        .and_then(serde_json::Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Text form of a metadata value, as Postgres `->>` renders it.
pub fn metadata_value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn memory_not_found(id: Uuid) -> CoreError {
    CoreError::not_found("memory", id.to_string())
}
