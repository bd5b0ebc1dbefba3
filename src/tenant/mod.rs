//! Tenants: configuration entries, resolved handles, configuration sources,
//! the row-level isolation scope and the [`TenantResourceManager`] that
//! owns every tenant's live resources.

pub mod factory;
pub mod manager;
pub mod scope;
pub mod source;
pub mod storage;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use factory::{DefaultResourceFactory, ResourceFactory};
pub use manager::{TenantResourceManager, TenantStats};
pub use scope::TenantScope;
pub use source::{DatabaseTenantSource, TenantSource, YamlTenantSource};
pub use storage::TenantStorage;

use crate::error::{CoreError, CoreResult};
use crate::llm::LlmSettings;
use crate::llm::provider::DEFAULT_EMBEDDING_MODEL;
use crate::memory::{MemoryBackend, Metadata};
use crate::tools::builtin_capability_names;

/// Namespace for tenant ids derived from routing keys.
const TENANT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3a2b_9c84_4e57_a0b1_5f2c_8d3e_7a19);

/// Deterministic id for a tenant configured without one.
pub fn derive_tenant_id(routing_key: &str) -> String {
    let uuid = Uuid::new_v5(&TENANT_ID_NAMESPACE, routing_key.trim().as_bytes());
    let hex = uuid.simple().to_string();
    format!("tenant_{}", &hex[..16])
}

/// One tenant as written in a tenants file or the `tenant_configs` table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TenantEntry {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub routing_key: String,
    #[serde(default)]
    pub db_dsn: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub vector_store: Option<String>,
    #[serde(default)]
    pub enabled_capabilities: Option<Vec<String>>,
    /// Per-tenant provider override.
    #[serde(default)]
    pub llm: Option<LlmSettings>,
    #[serde(default)]
    pub config: Metadata,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Values filled in for fields a tenant entry leaves out.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantDefaults {
    /// Shared-database DSN; when set, tenants may omit `db_dsn`.
    pub database_url: Option<String>,
    pub vector_store: MemoryBackend,
    pub embedding_model: String,
}

impl Default for TenantDefaults {
    fn default() -> Self {
        Self {
            database_url: None,
            vector_store: MemoryBackend::PgVector,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

/// A validated tenant with every default applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantHandle {
    pub tenant_id: String,
    pub routing_key: String,
    /// Effective DSN: the tenant's own, else the shared database.
    #[serde(skip)]
    pub db_dsn: Option<String>,
    pub embedding_model: String,
    pub vector_store: MemoryBackend,
    pub enabled_capabilities: Vec<String>,
    #[serde(skip)]
    pub llm: Option<LlmSettings>,
    #[serde(skip)]
    pub config: Metadata,
    pub metadata: Metadata,
}

impl TenantHandle {
    pub fn is_capability_enabled(&self, name: &str) -> bool {
        self.enabled_capabilities.iter().any(|c| c == name)
    }
}

impl TenantEntry {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    /// Validate the entry and apply `defaults`.
    pub fn resolve(self, defaults: &TenantDefaults) -> CoreResult<TenantHandle> {
        let routing_key = self.routing_key.trim().to_string();
        if routing_key.is_empty() {
            return Err(CoreError::Config("tenant routing_key is required".to_string()));
        }

        let tenant_id = match self.tenant_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => derive_tenant_id(&routing_key),
        };

        let vector_store = match self.vector_store.as_deref().map(str::trim) {
            None | Some("") => defaults.vector_store,
            Some(name) if MemoryBackend::NAMES.contains(&name) => MemoryBackend::from_name(name),
            Some(other) => {
                return Err(CoreError::Config(format!(
                    "tenant {tenant_id}: unsupported vector_store '{other}' (expected one of: {})",
                    MemoryBackend::NAMES.join(", ")
                )));
            }
        };

        let db_dsn = self
            .db_dsn
            .filter(|dsn| !dsn.trim().is_empty())
            .or_else(|| defaults.database_url.clone());
        if db_dsn.is_none() && vector_store.needs_database() {
            return Err(CoreError::Config(format!(
                "tenant {tenant_id}: db_dsn is required when no shared database is configured"
            )));
        }

        let embedding_model = self
            .embedding_model
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.llm.as_ref().map(|llm| llm.model_embed.clone()))
            .unwrap_or_else(|| defaults.embedding_model.clone());

        Ok(TenantHandle {
            tenant_id,
            routing_key,
            db_dsn,
            embedding_model,
            vector_store,
            enabled_capabilities: self.enabled_capabilities.unwrap_or_else(builtin_capability_names),
            llm: self.llm,
            config: self.config,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> TenantDefaults {
        TenantDefaults {
            database_url: Some("postgres://localhost/assistant".into()),
            ..TenantDefaults::default()
        }
    }

    #[test]
    fn test_derived_id_is_stable() {
        let a = derive_tenant_id("+15551234567");
        assert_eq!(a, derive_tenant_id("+15551234567"));
        assert_ne!(a, derive_tenant_id("+15557654321"));
        assert!(a.starts_with("tenant_"));
        assert_eq!(a.len(), "tenant_".len() + 16);
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let handle = TenantEntry::new("+1555").resolve(&shared()).unwrap();
        assert_eq!(handle.tenant_id, derive_tenant_id("+1555"));
        assert_eq!(handle.vector_store, MemoryBackend::PgVector);
        assert_eq!(handle.embedding_model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(handle.db_dsn.as_deref(), Some("postgres://localhost/assistant"));
        assert!(handle.is_capability_enabled("call_api"));
    }

    #[test]
    fn test_resolve_rejects_bad_entries() {
        assert!(TenantEntry::new("  ").resolve(&shared()).is_err());

        let unknown = TenantEntry {
            vector_store: Some("qdrant".into()),
            ..TenantEntry::new("+1555")
        };
        assert!(matches!(unknown.resolve(&shared()), Err(CoreError::Config(_))));

        let no_dsn = TenantEntry::new("+1555").resolve(&TenantDefaults::default());
        assert!(matches!(no_dsn, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_in_memory_tenant_needs_no_database() {
        let entry = TenantEntry {
            tenant_id: Some("acme".into()),
            vector_store: Some("in_memory".into()),
            enabled_capabilities: Some(vec!["search".into()]),
            ..TenantEntry::new("+1555")
        };
        let handle = entry.resolve(&TenantDefaults::default()).unwrap();
        assert_eq!(handle.tenant_id, "acme");
        assert!(handle.db_dsn.is_none());
        assert!(handle.is_capability_enabled("search"));
        assert!(!handle.is_capability_enabled("call_api"));
    }
}
