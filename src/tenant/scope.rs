//! Row-level isolation context.
//!
//! Shared-database deployments protect tenant rows with RLS policies that
//! read the `app.current_tenant` and `app.admin` settings. A [`TenantScope`]
//! is the only place they are written: it opens a transaction, sets both
//! transaction-locally, and hands out the connection for the duration of one
//! storage operation. A connection with neither setting sees no rows.

use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::trace;

use crate::error::CoreResult;

/// Session variable consulted by the RLS policies.
pub const TENANT_SETTING: &str = "app.current_tenant";

/// `on` only inside [`TenantScope::admin`]; lets a scope see every tenant.
pub const ADMIN_SETTING: &str = "app.admin";

/// A transaction bound to one tenant (or to none, for admin work).
///
/// [`release`](Self::release) commits. Dropping the scope without releasing
/// rolls the transaction back, which also discards the setting.
#[derive(Debug)]
pub struct TenantScope {
    tx: Transaction<'static, Postgres>,
    tenant_id: Option<String>,
}

impl TenantScope {
    /// Open a transaction scoped to `tenant_id`.
    pub async fn acquire(pool: &PgPool, tenant_id: &str) -> CoreResult<Self> {
        Self::begin(pool, Some(tenant_id)).await
    }

    /// Open a transaction with the tenant context cleared and the admin
    /// marker set, for operations that enumerate every tenant.
    pub async fn admin(pool: &PgPool) -> CoreResult<Self> {
        Self::begin(pool, None).await
    }

    async fn begin(pool: &PgPool, tenant_id: Option<&str>) -> CoreResult<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT set_config($1, $2, true), set_config($3, $4, true)")
            .bind(TENANT_SETTING)
            .bind(tenant_id.unwrap_or_default())
            .bind(ADMIN_SETTING)
            .bind(if tenant_id.is_some() { "off" } else { "on" })
            .execute(&mut *tx)
            .await?;

        trace!(tenant_id = ?tenant_id, "tenant scope acquired");
        Ok(Self {
            tx,
            tenant_id: tenant_id.map(ToString::to_string),
        })
    }

    /// `None` for admin scopes.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Connection to run statements on inside the scope.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Commit the work done in this scope.
    pub async fn release(self) -> CoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
