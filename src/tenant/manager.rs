//! Per-tenant resource cache.
//!
//! The manager owns the tenant table and, per tenant id, at most one storage
//! handle, one memory store and one LLM provider. Resources are built on
//! first use. Lookups take the read lock; construction re-checks under the
//! write lock so concurrent first callers share a single instance, and a
//! failed construction leaves nothing behind.
//!
//! Reload swaps the whole table at once. Tenants that disappear have their
//! resources evicted and closed; surviving tenants keep their live handles
//! even when their configuration changed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::factory::ResourceFactory;
use super::source::TenantSource;
use super::storage::TenantStorage;
use super::{TenantDefaults, TenantEntry, TenantHandle};
use crate::error::{CoreError, CoreResult};
use crate::llm::LlmProvider;
use crate::memory::{MemoryPipeline, MemoryStore, PipelineConfig};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::tools::builtin_registry;

const CLOSED: &str = "tenant manager closed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantStats {
    pub total_tenants: usize,
    pub active_storage: usize,
    pub active_memory_stores: usize,
    pub active_llm_providers: usize,
    pub tenant_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct TenantTable {
    by_routing_key: HashMap<String, String>,
    by_id: HashMap<String, Arc<TenantHandle>>,
}

impl TenantTable {
    fn build(entries: Vec<TenantEntry>, defaults: &TenantDefaults) -> CoreResult<Self> {
        let mut table = Self::default();
        for entry in entries {
            let handle = entry.resolve(defaults)?;
            if table.by_id.contains_key(&handle.tenant_id) {
                return Err(CoreError::Config(format!("duplicate tenant id: {}", handle.tenant_id)));
            }
            if table.by_routing_key.contains_key(&handle.routing_key) {
                return Err(CoreError::Config(format!(
                    "duplicate routing key: {}",
                    handle.routing_key
                )));
            }
            table
                .by_routing_key
                .insert(handle.routing_key.clone(), handle.tenant_id.clone());
            table.by_id.insert(handle.tenant_id.clone(), Arc::new(handle));
        }
        Ok(table)
    }
}

/// Live resources of one tenant, taken out of the cache for closing.
#[derive(Default)]
struct Evicted {
    storage: Option<Arc<TenantStorage>>,
    memory: Option<Arc<dyn MemoryStore>>,
    provider: Option<Arc<dyn LlmProvider>>,
}

impl Evicted {
    fn is_empty(&self) -> bool {
        self.storage.is_none() && self.memory.is_none() && self.provider.is_none()
    }

    /// Close memory store before the pool it may share.
    async fn close(self, tenant_id: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(memory) = self.memory {
            if let Err(e) = memory.close().await {
                warn!(tenant_id = %tenant_id, error = %e, "failed to close memory store");
                errors.push(format!("memory store for {tenant_id}: {e}"));
            }
        }
        if let Some(storage) = self.storage {
            storage.close().await;
        }
        drop(self.provider);
        errors
    }
}

#[derive(Default)]
struct ManagerState {
    table: TenantTable,
    storage: HashMap<String, Arc<TenantStorage>>,
    memory: HashMap<String, Arc<dyn MemoryStore>>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    closed: bool,
}

impl ManagerState {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            Err(CoreError::StorageUnavailable(CLOSED.to_string()))
        } else {
            Ok(())
        }
    }

    fn tenant(&self, tenant_id: &str) -> CoreResult<Arc<TenantHandle>> {
        self.table
            .by_id
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tenant", tenant_id))
    }

    fn evict(&mut self, tenant_id: &str) -> Evicted {
        Evicted {
            storage: self.storage.remove(tenant_id),
            memory: self.memory.remove(tenant_id),
            provider: self.providers.remove(tenant_id),
        }
    }
}

#[derive(Clone)]
pub struct TenantResourceManager {
    state: Arc<RwLock<ManagerState>>,
    source: Arc<dyn TenantSource>,
    factory: Arc<dyn ResourceFactory>,
    defaults: TenantDefaults,
    pipeline_config: PipelineConfig,
    orchestrator_config: OrchestratorConfig,
}

impl std::fmt::Debug for TenantResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantResourceManager")
            .field("source", &self.source.describe())
            .field("factory", &self.factory)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl TenantResourceManager {
    /// Load the tenant table from `source`. No resources are built yet.
    pub async fn load(
        source: Arc<dyn TenantSource>,
        factory: Arc<dyn ResourceFactory>,
        defaults: TenantDefaults,
    ) -> CoreResult<Self> {
        let table = TenantTable::build(source.load().await?, &defaults)?;
        info!(source = %source.describe(), tenants = table.by_id.len(), "tenant table loaded");

        Ok(Self {
            state: Arc::new(RwLock::new(ManagerState {
                table,
                ..ManagerState::default()
            })),
            source,
            factory,
            defaults,
            pipeline_config: PipelineConfig::default(),
            orchestrator_config: OrchestratorConfig::default(),
        })
    }

    #[must_use]
    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline_config = config;
        self
    }

    #[must_use]
    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    pub async fn resolve(&self, routing_key: &str) -> CoreResult<Arc<TenantHandle>> {
        let state = self.state.read().await;
        let tenant_id = state
            .table
            .by_routing_key
            .get(routing_key.trim())
            .ok_or_else(|| CoreError::not_found("tenant", format!("routing key {routing_key}")))?;
        state.tenant(tenant_id)
    }

    pub async fn resolve_by_id(&self, tenant_id: &str) -> CoreResult<Arc<TenantHandle>> {
        self.state.read().await.tenant(tenant_id)
    }

    /// Every tenant, ordered by id.
    pub async fn list_all(&self) -> Vec<Arc<TenantHandle>> {
        let state = self.state.read().await;
        let mut tenants: Vec<_> = state.table.by_id.values().cloned().collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    /// Unknown tenants have nothing enabled.
    pub async fn is_capability_enabled(&self, tenant_id: &str, name: &str) -> bool {
        self.state
            .read()
            .await
            .table
            .by_id
            .get(tenant_id)
            .is_some_and(|t| t.is_capability_enabled(name))
    }

    #[instrument(skip(self))]
    pub async fn get_storage(&self, tenant_id: &str) -> CoreResult<Arc<TenantStorage>> {
        {
            let state = self.state.read().await;
            state.ensure_open()?;
            if let Some(storage) = state.storage.get(tenant_id) {
                return Ok(Arc::clone(storage));
            }
        }

        let mut state = self.state.write().await;
        state.ensure_open()?;
        if let Some(storage) = state.storage.get(tenant_id) {
            return Ok(Arc::clone(storage));
        }

        let tenant = state.tenant(tenant_id)?;
        let storage = Arc::new(self.factory.create_storage(&tenant).await?);
        state.storage.insert(tenant_id.to_string(), Arc::clone(&storage));
        info!(name: "tenant.storage.created", tenant_id = %tenant_id, "tenant storage created");
        Ok(storage)
    }

    #[instrument(skip(self))]
    pub async fn get_memory_store(&self, tenant_id: &str) -> CoreResult<Arc<dyn MemoryStore>> {
        loop {
            let tenant = {
                let state = self.state.read().await;
                state.ensure_open()?;
                if let Some(store) = state.memory.get(tenant_id) {
                    return Ok(Arc::clone(store));
                }
                state.tenant(tenant_id)?
            };

            let storage = if tenant.vector_store.needs_database() {
                Some(self.get_storage(tenant_id).await?)
            } else {
                None
            };

            let mut state = self.state.write().await;
            state.ensure_open()?;
            if let Some(store) = state.memory.get(tenant_id) {
                return Ok(Arc::clone(store));
            }

            // A reload may have run while no lock was held: the tenant must
            // still exist and the storage must still be the cached one.
            let tenant = state.tenant(tenant_id)?;
            if let Some(storage) = &storage {
                if !state.storage.get(tenant_id).is_some_and(|s| Arc::ptr_eq(s, storage)) {
                    debug!(tenant_id = %tenant_id, "tenant storage replaced during lookup, retrying");
                    continue;
                }
            }

            let store = self
                .factory
                .create_memory_store(&tenant, storage.as_deref())
                .await?;
            state.memory.insert(tenant_id.to_string(), Arc::clone(&store));
            info!(
                name: "tenant.memory_store.created",
                tenant_id = %tenant_id,
                backend = %store.backend(),
                "tenant memory store created"
            );
            return Ok(store);
        }
    }

    #[instrument(skip(self))]
    pub async fn get_llm_provider(&self, tenant_id: &str) -> CoreResult<Arc<dyn LlmProvider>> {
        {
            let state = self.state.read().await;
            state.ensure_open()?;
            if let Some(provider) = state.providers.get(tenant_id) {
                return Ok(Arc::clone(provider));
            }
        }

        let mut state = self.state.write().await;
        state.ensure_open()?;
        if let Some(provider) = state.providers.get(tenant_id) {
            return Ok(Arc::clone(provider));
        }

        let tenant = state.tenant(tenant_id)?;
        let provider = self.factory.create_provider(&tenant)?;
        state.providers.insert(tenant_id.to_string(), Arc::clone(&provider));
        info!(
            name: "tenant.llm_provider.created",
            tenant_id = %tenant_id,
            provider = %provider.name(),
            "tenant LLM provider created"
        );
        Ok(provider)
    }

    /// Assemble the orchestrator for one tenant: its provider, its memory
    /// pipeline and the built-in capabilities it has enabled.
    pub async fn build_orchestrator(&self, tenant_id: &str) -> CoreResult<Orchestrator> {
        let tenant = self.resolve_by_id(tenant_id).await?;
        let provider = self.get_llm_provider(tenant_id).await?;
        let store = self.get_memory_store(tenant_id).await?;

        let pipeline = MemoryPipeline::new(store, Arc::clone(&provider), self.pipeline_config.clone());
        let registry = builtin_registry(&pipeline, &tenant.config)?.restricted_to(&tenant.enabled_capabilities);
        debug!(tenant_id = %tenant_id, capabilities = ?registry.names(), "orchestrator assembled");

        Ok(Orchestrator::new(provider, registry, self.orchestrator_config.clone()).with_memory(pipeline))
    }

    /// Re-read the source and swap in the new table.
    ///
    /// A source or validation failure leaves the current table untouched.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> CoreResult<()> {
        let table = TenantTable::build(self.source.load().await?, &self.defaults)?;

        let evicted: Vec<(String, Evicted)> = {
            let mut state = self.state.write().await;
            state.ensure_open()?;

            let removed: Vec<String> = state
                .table
                .by_id
                .keys()
                .filter(|id| !table.by_id.contains_key(*id))
                .cloned()
                .collect();
            state.table = table;

            removed
                .into_iter()
                .map(|id| {
                    let resources = state.evict(&id);
                    (id, resources)
                })
                .collect()
        };

        // Evicted tenants close concurrently.
        let closing = evicted
            .into_iter()
            .filter(|(_, resources)| !resources.is_empty())
            .map(|(tenant_id, resources)| async move {
                let errors = resources.close(&tenant_id).await;
                info!(
                    name: "tenant.evicted",
                    tenant_id = %tenant_id,
                    close_errors = errors.len(),
                    "removed tenant resources released"
                );
            });
        join_all(closing).await;

        let stats = self.stats().await;
        info!(name: "tenant.reloaded", tenants = stats.total_tenants, "tenant table reloaded");
        Ok(())
    }

    /// Release every cached resource. Later calls are no-ops; accessors then
    /// fail with `StorageUnavailable`.
    pub async fn close(&self) -> CoreResult<()> {
        let evicted: Vec<(String, Evicted)> = {
            let mut state = self.state.write().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            let mut ids: Vec<String> = state
                .storage
                .keys()
                .chain(state.memory.keys())
                .chain(state.providers.keys())
                .cloned()
                .collect();
            ids.sort();
            ids.dedup();
            ids.into_iter()
                .map(|id| {
                    let resources = state.evict(&id);
                    (id, resources)
                })
                .collect()
        };

        let closing = evicted
            .into_iter()
            .map(|(tenant_id, resources)| async move { resources.close(&tenant_id).await });
        let mut errors: Vec<String> = join_all(closing).await.into_iter().flatten().collect();
        if let Err(e) = self.source.close().await {
            warn!(source = %self.source.describe(), error = %e, "failed to close tenant source");
            errors.push(format!("tenant source: {e}"));
        }

        info!(name: "tenant.manager.closed", errors = errors.len(), "tenant manager closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::StorageUnavailable(format!(
                "errors during close: {}",
                errors.join("; ")
            )))
        }
    }

    pub async fn stats(&self) -> TenantStats {
        let state = self.state.read().await;
        let mut tenant_ids: Vec<String> = state.table.by_id.keys().cloned().collect();
        tenant_ids.sort();
        TenantStats {
            total_tenants: state.table.by_id.len(),
            active_storage: state.storage.len(),
            active_memory_stores: state.memory.len(),
            active_llm_providers: state.providers.len(),
            tenant_ids,
        }
    }
}
