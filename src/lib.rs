//! Multi-tenant assistant orchestration core.
//!
//! Every inbound message is resolved to a tenant and user, then handed to an
//! [`orchestrator::Orchestrator`] that decides whether to answer directly or
//! drive the model through capability calls, using the tenant's long-term
//! memory for context.
//!
//! # Modules
//!
//! - [`tools`]: capability schemas, validation and dispatch, plus built-ins
//! - [`memory`]: memory stores and the chunk/embed/rerank pipeline
//! - [`orchestrator`]: intent classification, tool gate, turn loop
//! - [`tenant`]: tenant table and per-tenant resource cache
//! - [`llm`]: chat-completion and embedding providers
//! - [`server`]: thin HTTP surface over `process_turn`

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod server;
pub mod telemetry;
pub mod tenant;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{AppConfig, TenantSourceKind};
use crate::error::{CoreError, CoreResult};
use crate::tenant::{
    DatabaseTenantSource, DefaultResourceFactory, TenantResourceManager, TenantSource, YamlTenantSource,
};

/// Schema for memory chunks and tenant configuration.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Tenant table and per-tenant resources.
    pub manager: TenantResourceManager,
    /// Upper bound on one request.
    pub request_timeout: Duration,
}

/// Connect an administrative pool to the shared database.
pub async fn connect_admin_pool(config: &AppConfig) -> CoreResult<PgPool> {
    let url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| CoreError::Config("database.url is not configured".to_string()))?;
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|e| CoreError::StorageUnavailable(format!("connect failed: {e}")))
}

/// Apply pending migrations.
pub async fn run_migrations(pool: &PgPool) -> CoreResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| CoreError::StorageUnavailable(format!("migration failed: {e}")))
}

/// Build the tenant manager described by `config` and load its table.
pub async fn build_tenant_manager(config: &AppConfig) -> CoreResult<TenantResourceManager> {
    let source: Arc<dyn TenantSource> = match config.tenants.source {
        TenantSourceKind::Yaml => Arc::new(YamlTenantSource::new(&config.tenants.path)),
        TenantSourceKind::Database => Arc::new(DatabaseTenantSource::new(connect_admin_pool(config).await?)),
    };
    let factory = Arc::new(DefaultResourceFactory::new(
        config.llm.clone(),
        config.database.max_connections,
    ));

    let manager = TenantResourceManager::load(source, factory, config.tenant_defaults()).await?;
    Ok(config.configure(manager))
}
