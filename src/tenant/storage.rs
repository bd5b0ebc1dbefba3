//! Tenant-scoped relational storage handle.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// A tenant's connection pool. Stores open a [`TenantScope`](super::TenantScope)
/// on it for every statement.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct TenantStorage {
    tenant_id: String,
    pool: PgPool,
}

impl TenantStorage {
    /// Connect a new pool for `tenant_id`.
    pub async fn connect(tenant_id: &str, dsn: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .map_err(|e| CoreError::StorageUnavailable(format!("connect failed: {e}")))?;

        info!(tenant_id = %tenant_id, max_connections, "tenant storage pool connected");
        Ok(Self::from_pool(tenant_id, pool))
    }

    pub fn from_pool(tenant_id: &str, pool: PgPool) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool. Later calls are no-ops.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(tenant_id = %self.tenant_id, "tenant storage pool closed");
        }
    }
}
