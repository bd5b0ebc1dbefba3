//! Vector-native memory store on Postgres + `pgvector`.
//!
//! Scores are `1 - (embedding <=> query)`, i.e. cosine similarity. Every
//! statement runs inside a [`TenantScope`] so RLS policies see the owning
//! tenant.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::sql::{self, INSERT_WITH_EMBEDDING};
use super::{MemoryBackend, MemoryHit, MemoryRecord, MemoryStore, MemoryUpdate, NewMemory, SearchOptions};
use crate::error::CoreResult;
use crate::tenant::scope::TenantScope;

#[derive(Debug, Clone)]
pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    /// Build on an existing pool, usually the tenant's storage pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemoryStore for PgVectorStore {
    fn backend(&self) -> MemoryBackend {
        MemoryBackend::PgVector
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, tenant_id: &str, user_id: Uuid, records: Vec<NewMemory>) -> CoreResult<Vec<Uuid>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            if record.embedding.is_empty() {
                warn!(kind = %record.kind, "missing embedding in memory item");
                continue;
            }

            let id: Uuid = sqlx::query_scalar(INSERT_WITH_EMBEDDING)
                .bind(record.id.unwrap_or_else(Uuid::new_v4))
                .bind(tenant_id)
                .bind(user_id)
                .bind(record.kind.as_str())
                .bind(&record.text)
                .bind(Vector::from(record.embedding))
                .bind(serde_json::Value::Object(record.metadata))
                .fetch_one(scope.conn())
                .await?;
            ids.push(id);
        }

        scope.release().await?;
        debug!(tenant_id = %tenant_id, count = ids.len(), "memory items upserted");
        Ok(ids)
    }

    #[instrument(skip(self, query_embedding, options), fields(top_k = options.top_k))]
    async fn search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        query_embedding: &[f32],
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>> {
        let query = Vector::from(query_embedding.to_vec());

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT id, kind, text, metadata, (1 - (embedding <=> ",
        );
        qb.push_bind(query.clone());
        qb.push("))::float8 AS similarity_score FROM memory_chunks WHERE tenant_id = ");
        qb.push_bind(tenant_id.to_string());
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND embedding IS NOT NULL");

        sql::push_filters(&mut qb, &options.filter);

        if options.min_score > 0.0 {
            qb.push(" AND (1 - (embedding <=> ");
            qb.push_bind(query);
            qb.push(")) >= ");
            qb.push_bind(f64::from(options.min_score));
        }

        qb.push(" ORDER BY similarity_score DESC");
        if options.top_k > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(options.top_k).unwrap_or(i64::MAX));
        }

        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let rows = qb.build().fetch_all(scope.conn()).await?;
        scope.release().await?;

        let hits = rows
            .iter()
            .map(|row| sql::hit_from_row(row, "similarity_score"))
            .collect::<CoreResult<Vec<_>>>()?;

        debug!(tenant_id = %tenant_id, hits = hits.len(), "similarity search completed");
        Ok(hits)
    }

    async fn get_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<MemoryRecord> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let record = sql::fetch_record(scope.conn(), tenant_id, user_id, id, true).await?;
        scope.release().await?;
        Ok(record)
    }

    async fn update_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid, update: MemoryUpdate) -> CoreResult<()> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        sql::apply_update(scope.conn(), tenant_id, user_id, id, update, true).await?;
        scope.release().await?;
        debug!(id = %id, tenant_id = %tenant_id, "memory chunk updated");
        Ok(())
    }

    async fn delete_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<()> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        sql::delete_record(scope.conn(), tenant_id, user_id, id).await?;
        scope.release().await?;
        debug!(id = %id, tenant_id = %tenant_id, "memory chunk deleted");
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
        Ok(())
    }
}
