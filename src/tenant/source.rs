//! Where the tenant table comes from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::TenantEntry;
use super::scope::TenantScope;
use crate::error::{CoreError, CoreResult};
use crate::memory::Metadata;

/// Source of truth for the tenant table, re-read on every reload.
#[async_trait]
pub trait TenantSource: Send + Sync + std::fmt::Debug {
    /// Short description for logs.
    fn describe(&self) -> String;

    async fn load(&self) -> CoreResult<Vec<TenantEntry>>;

    /// Release whatever the source holds open. Called once on shutdown.
    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: Vec<TenantEntry>,
}

/// A YAML file with a top-level `tenants:` list.
#[derive(Debug, Clone)]
pub struct YamlTenantSource {
    path: PathBuf,
}

impl YamlTenantSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse a tenants document.
    pub fn parse(content: &str) -> CoreResult<Vec<TenantEntry>> {
        let file: TenantsFile = serde_yaml::from_str(content)
            .map_err(|e| CoreError::Config(format!("failed to parse tenants file: {e}")))?;
        Ok(file.tenants)
    }
}

#[async_trait]
impl TenantSource for YamlTenantSource {
    fn describe(&self) -> String {
        format!("yaml:{}", self.path.display())
    }

    async fn load(&self) -> CoreResult<Vec<TenantEntry>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CoreError::Config(format!("failed to read tenants file {}: {e}", self.path.display()))
        })?;
        let entries = Self::parse(&content)?;
        debug!(path = %self.path.display(), count = entries.len(), "tenants file loaded");
        Ok(entries)
    }
}

const SELECT_ENABLED_TENANTS: &str = r"
    SELECT tenant_id, routing_key, db_dsn, embedding_model, vector_store,
           enabled_capabilities, config, metadata
    FROM tenant_configs
    WHERE enabled = true
    ORDER BY tenant_id";

/// Enabled rows of the `tenant_configs` table.
///
/// The query enumerates every tenant, so it runs in an admin scope with the
/// isolation context cleared.
#[derive(Debug, Clone)]
pub struct DatabaseTenantSource {
    pool: PgPool,
}

impl DatabaseTenantSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn json_map(value: Option<serde_json::Value>) -> Metadata {
    match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => Metadata::new(),
    }
}

#[async_trait]
impl TenantSource for DatabaseTenantSource {
    fn describe(&self) -> String {
        "database:tenant_configs".to_string()
    }

    async fn load(&self) -> CoreResult<Vec<TenantEntry>> {
        let mut scope = TenantScope::admin(&self.pool).await?;
        let rows = sqlx::query(SELECT_ENABLED_TENANTS).fetch_all(scope.conn()).await?;
        scope.release().await?;

        let entries = rows
            .into_iter()
            .map(|row| {
                Ok(TenantEntry {
                    tenant_id: Some(row.try_get("tenant_id")?),
                    routing_key: row.try_get("routing_key")?,
                    db_dsn: row.try_get("db_dsn")?,
                    embedding_model: row.try_get("embedding_model")?,
                    vector_store: row.try_get("vector_store")?,
                    enabled_capabilities: row.try_get("enabled_capabilities")?,
                    llm: None,
                    config: json_map(row.try_get("config")?),
                    metadata: json_map(row.try_get("metadata")?),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        info!(count = entries.len(), "tenant configurations loaded from database");
        Ok(entries)
    }

    async fn close(&self) -> CoreResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!("tenant config pool closed");
        }
        Ok(())
    }
}
