//! Lexical fallback memory store.
//!
//! For deployments where the `vector` extension is unavailable. Embeddings
//! are ignored on write; search ranks with Postgres full-text search over the
//! query text and, when that fails or finds nothing, degrades further to a
//! substring check scoring `1.0` for a text match and `0.5` for a kind match.
//!
//! Scores from this store are relevance ranks on their own scale. They are
//! not comparable to cosine similarity, so `min_score` thresholds tuned for
//! the vector store do not carry over. Relevance is best-effort only.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::sql::{self, INSERT_WITHOUT_EMBEDDING};
use super::{MemoryBackend, MemoryHit, MemoryRecord, MemoryStore, MemoryUpdate, NewMemory, SearchOptions};
use crate::error::CoreResult;
use crate::tenant::scope::TenantScope;

/// Search term used when the caller supplies neither query text nor a kind.
pub const DEFAULT_SEARCH_TERM: &str = "memory";

#[derive(Debug, Clone)]
pub struct LexicalStore {
    pool: PgPool,
}

impl LexicalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ranked_search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        term: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT id, kind, text, metadata, ts_rank_cd(text_search, plainto_tsquery('english', ",
        );
        qb.push_bind(term.to_string());
        qb.push("))::float8 AS rank FROM memory_chunks WHERE tenant_id = ");
        qb.push_bind(tenant_id.to_string());
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND text_search @@ plainto_tsquery('english', ");
        qb.push_bind(term.to_string());
        qb.push(")");

        sql::push_filters(&mut qb, &options.filter);

        if options.min_score > 0.0 {
            qb.push(" AND ts_rank_cd(text_search, plainto_tsquery('english', ");
            qb.push_bind(term.to_string());
            qb.push(")) >= ");
            qb.push_bind(f64::from(options.min_score));
        }

        qb.push(" ORDER BY rank DESC");
        push_limit(&mut qb, options.top_k);

        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let rows = qb.build().fetch_all(scope.conn()).await?;
        scope.release().await?;

        rows.iter().map(|row| sql::hit_from_row(row, "rank")).collect()
    }

    async fn pattern_search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        term: &str,
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>> {
        let pattern = like_pattern(term);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT id, kind, text, metadata, (CASE WHEN text ILIKE ",
        );
        qb.push_bind(pattern.clone());
        qb.push(" THEN 1.0 ELSE 0.5 END)::float8 AS score FROM memory_chunks WHERE tenant_id = ");
        qb.push_bind(tenant_id.to_string());
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND (text ILIKE ");
        qb.push_bind(pattern.clone());
        qb.push(" OR kind ILIKE ");
        qb.push_bind(pattern);
        qb.push(")");

        sql::push_filters(&mut qb, &options.filter);

        qb.push(" ORDER BY score DESC, created_at DESC");
        push_limit(&mut qb, options.top_k);

        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let rows = qb.build().fetch_all(scope.conn()).await?;
        scope.release().await?;

        rows.iter().map(|row| sql::hit_from_row(row, "score")).collect()
    }
}

fn push_limit(qb: &mut QueryBuilder<'_, Postgres>, top_k: usize) {
    if top_k > 0 {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(top_k).unwrap_or(i64::MAX));
    }
}

/// The term to rank on: the query text, else the first kind filter, else
/// [`DEFAULT_SEARCH_TERM`].
pub fn search_term(options: &SearchOptions) -> String {
    options
        .query_text
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(ToString::to_string)
        .or_else(|| options.filter.kinds.first().map(|k| k.as_str().to_string()))
        .unwrap_or_else(|| DEFAULT_SEARCH_TERM.to_string())
}

/// `%term%` with LIKE metacharacters escaped.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl MemoryStore for LexicalStore {
    fn backend(&self) -> MemoryBackend {
        MemoryBackend::SqlFallback
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, tenant_id: &str, user_id: Uuid, records: Vec<NewMemory>) -> CoreResult<Vec<Uuid>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let id: Uuid = sqlx::query_scalar(INSERT_WITHOUT_EMBEDDING)
                .bind(record.id.unwrap_or_else(Uuid::new_v4))
                .bind(tenant_id)
                .bind(user_id)
                .bind(record.kind.as_str())
                .bind(&record.text)
                .bind(serde_json::Value::Object(record.metadata))
                .fetch_one(scope.conn())
                .await?;
            ids.push(id);
        }

        scope.release().await?;
        debug!(tenant_id = %tenant_id, count = ids.len(), "memory items upserted (SQL fallback)");
        Ok(ids)
    }

    #[instrument(skip(self, _query_embedding, options), fields(top_k = options.top_k))]
    async fn search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        _query_embedding: &[f32],
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>> {
        let term = search_term(options);

        let hits = match self.ranked_search(tenant_id, user_id, &term, options).await {
            Ok(hits) if !hits.is_empty() => hits,
            Ok(_) => {
                debug!(search_text = %crate::telemetry::sanitize_text(&term), "no ranked hits, using ILIKE fallback search");
                self.pattern_search(tenant_id, user_id, &term, options).await?
            }
            Err(e) => {
                warn!(error = %e, "full-text search failed, using ILIKE fallback search");
                self.pattern_search(tenant_id, user_id, &term, options).await?
            }
        };

        debug!(tenant_id = %tenant_id, hits = hits.len(), "text search completed (SQL fallback)");
        Ok(hits)
    }

    async fn get_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<MemoryRecord> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        let record = sql::fetch_record(scope.conn(), tenant_id, user_id, id, false).await?;
        scope.release().await?;
        Ok(record)
    }

    async fn update_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid, update: MemoryUpdate) -> CoreResult<()> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        sql::apply_update(scope.conn(), tenant_id, user_id, id, update, false).await?;
        scope.release().await?;
        debug!(id = %id, tenant_id = %tenant_id, "memory chunk updated (SQL fallback)");
        Ok(())
    }

    async fn delete_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<()> {
        let mut scope = TenantScope::acquire(&self.pool, tenant_id).await?;
        sql::delete_record(scope.conn(), tenant_id, user_id, id).await?;
        scope.release().await?;
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
        Ok(())
    }
}
