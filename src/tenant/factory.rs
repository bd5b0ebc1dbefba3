//! Construction of per-tenant resources.
//!
//! The manager decides *when* a resource is built; a [`ResourceFactory`]
//! decides *how*. Backends are picked once per tenant from its
//! [`MemoryBackend`] and [`ProviderKind`](crate::llm::ProviderKind).

use std::sync::Arc;

use async_trait::async_trait;

use super::TenantHandle;
use super::storage::TenantStorage;
use crate::error::{CoreError, CoreResult};
use crate::llm::{LlmProvider, LlmSettings, build_provider};
use crate::memory::{InMemoryStore, LexicalStore, MemoryBackend, MemoryStore, PgVectorStore};

#[async_trait]
pub trait ResourceFactory: Send + Sync + std::fmt::Debug {
    async fn create_storage(&self, tenant: &TenantHandle) -> CoreResult<TenantStorage>;

    /// `storage` is the tenant's storage handle when its backend needs one.
    async fn create_memory_store(
        &self,
        tenant: &TenantHandle,
        storage: Option<&TenantStorage>,
    ) -> CoreResult<Arc<dyn MemoryStore>>;

    fn create_provider(&self, tenant: &TenantHandle) -> CoreResult<Arc<dyn LlmProvider>>;
}

/// Postgres pools, the built-in memory backends and the configured LLM.
#[derive(Debug, Clone)]
pub struct DefaultResourceFactory {
    llm: LlmSettings,
    max_connections: u32,
}

impl DefaultResourceFactory {
    pub fn new(llm: LlmSettings, max_connections: u32) -> Self {
        Self { llm, max_connections }
    }

    /// The tenant's own provider settings, else the global ones, with the
    /// tenant's embedding model.
    pub fn provider_settings(&self, tenant: &TenantHandle) -> LlmSettings {
        let mut settings = tenant.llm.clone().unwrap_or_else(|| self.llm.clone());
        settings.model_embed.clone_from(&tenant.embedding_model);
        settings
    }
}

#[async_trait]
impl ResourceFactory for DefaultResourceFactory {
    async fn create_storage(&self, tenant: &TenantHandle) -> CoreResult<TenantStorage> {
        let dsn = tenant.db_dsn.as_deref().ok_or_else(|| {
            CoreError::Config(format!("tenant {} has no database configured", tenant.tenant_id))
        })?;
        TenantStorage::connect(&tenant.tenant_id, dsn, self.max_connections).await
    }

    async fn create_memory_store(
        &self,
        tenant: &TenantHandle,
        storage: Option<&TenantStorage>,
    ) -> CoreResult<Arc<dyn MemoryStore>> {
        let pool = || {
            storage.map(|s| s.pool().clone()).ok_or_else(|| {
                CoreError::Config(format!(
                    "tenant {}: {} memory store needs a database",
                    tenant.tenant_id, tenant.vector_store
                ))
            })
        };

        Ok(match tenant.vector_store {
            MemoryBackend::PgVector => Arc::new(PgVectorStore::new(pool()?)),
            MemoryBackend::SqlFallback => Arc::new(LexicalStore::new(pool()?)),
            MemoryBackend::InMemory => Arc::new(InMemoryStore::new()),
        })
    }

    fn create_provider(&self, tenant: &TenantHandle) -> CoreResult<Arc<dyn LlmProvider>> {
        build_provider(&self.provider_settings(tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderKind;
    use crate::tenant::{TenantDefaults, TenantEntry};

    fn mock_settings() -> LlmSettings {
        LlmSettings {
            kind: ProviderKind::Mock,
            ..LlmSettings::default()
        }
    }

    fn in_memory_tenant() -> TenantHandle {
        TenantEntry {
            vector_store: Some("in_memory".into()),
            embedding_model: Some("local:bge-small".into()),
            ..TenantEntry::new("+1555")
        }
        .resolve(&TenantDefaults::default())
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_backend_needs_no_storage() {
        let factory = DefaultResourceFactory::new(mock_settings(), 2);
        let tenant = in_memory_tenant();
        let store = factory.create_memory_store(&tenant, None).await.unwrap();
        assert_eq!(store.backend(), MemoryBackend::InMemory);
        assert!(matches!(factory.create_storage(&tenant).await, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_vector_backend_without_storage_is_config_error() {
        let factory = DefaultResourceFactory::new(mock_settings(), 2);
        let mut tenant = in_memory_tenant();
        tenant.vector_store = MemoryBackend::PgVector;
        assert!(matches!(
            factory.create_memory_store(&tenant, None).await,
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_provider_settings_take_tenant_embedding_model() {
        let factory = DefaultResourceFactory::new(mock_settings(), 2);
        let settings = factory.provider_settings(&in_memory_tenant());
        assert_eq!(settings.kind, ProviderKind::Mock);
        assert_eq!(settings.model_embed, "local:bge-small");
        assert_eq!(factory.create_provider(&in_memory_tenant()).unwrap().name(), "mock");
    }
}
