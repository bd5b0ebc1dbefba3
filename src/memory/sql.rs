//! Statements shared by the Postgres-backed memory stores.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{MemoryHit, MemoryKind, MemoryRecord, MemoryUpdate, Metadata, SearchFilter, memory_not_found};
use crate::error::CoreResult;

pub(crate) const INSERT_WITH_EMBEDDING: &str = r"
    INSERT INTO memory_chunks (id, tenant_id, user_id, kind, text, embedding, metadata, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
    ON CONFLICT (id) DO UPDATE SET
        text = EXCLUDED.text,
        embedding = EXCLUDED.embedding,
        metadata = EXCLUDED.metadata,
        updated_at = EXCLUDED.updated_at
    RETURNING id
";

pub(crate) const INSERT_WITHOUT_EMBEDDING: &str = r"
    INSERT INTO memory_chunks (id, tenant_id, user_id, kind, text, metadata, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
    ON CONFLICT (id) DO UPDATE SET
        text = EXCLUDED.text,
        metadata = EXCLUDED.metadata,
        updated_at = EXCLUDED.updated_at
    RETURNING id
";

pub(crate) fn kind_names(kinds: &[MemoryKind]) -> Vec<String> {
    kinds.iter().map(|k| k.as_str().to_string()).collect()
}

/// Append `AND ...` clauses for kind, tag and metadata filters.
pub(crate) fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &SearchFilter) {
    if !filter.kinds.is_empty() {
        qb.push(" AND kind = ANY(");
        qb.push_bind(kind_names(&filter.kinds));
        qb.push(")");
    }
    if !filter.tags.is_empty() {
        qb.push(" AND metadata->'tags' ?| ");
        qb.push_bind(filter.tags.clone());
    }
    for (key, value) in &filter.meta {
        qb.push(" AND metadata->>");
        qb.push_bind(key.clone());
        qb.push(" = ");
        qb.push_bind(value.clone());
    }
}

fn metadata_from(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

/// Map a `(id, kind, text, metadata, <score>)` row.
pub(crate) fn hit_from_row(row: &PgRow, score_column: &str) -> CoreResult<MemoryHit> {
    let kind: String = row.try_get("kind")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    let score: f64 = row.try_get(score_column)?;

    #[allow(clippy::cast_possible_truncation)]
    Ok(MemoryHit {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        text: row.try_get("text")?,
        score: score as f32,
        metadata: metadata.map(metadata_from).unwrap_or_default(),
    })
}

pub(crate) async fn fetch_record(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: Uuid,
    id: Uuid,
    with_embedding: bool,
) -> CoreResult<MemoryRecord> {
    let sql = if with_embedding {
        "SELECT id, tenant_id, user_id, kind, text, embedding, metadata, created_at, updated_at
         FROM memory_chunks
         WHERE tenant_id = $1 AND user_id = $2 AND id = $3"
    } else {
        "SELECT id, tenant_id, user_id, kind, text, metadata, created_at, updated_at
         FROM memory_chunks
         WHERE tenant_id = $1 AND user_id = $2 AND id = $3"
    };

    let row = sqlx::query(sql)
        .bind(tenant_id)
        .bind(user_id)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| memory_not_found(id))?;

    let embedding = if with_embedding {
        let vector: Option<pgvector::Vector> = row.try_get("embedding")?;
        vector.map(|v| v.to_vec()).unwrap_or_default()
    } else {
        Vec::new()
    };

    let kind: String = row.try_get("kind")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;

    Ok(MemoryRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse()?,
        text: row.try_get("text")?,
        embedding,
        metadata: metadata.map(metadata_from).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Apply the supplied fields; `write_embedding` is false for the lexical store.
pub(crate) async fn apply_update(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: Uuid,
    id: Uuid,
    update: MemoryUpdate,
    write_embedding: bool,
) -> CoreResult<()> {
    let embedding = update.embedding.filter(|_| write_embedding);
    if update.text.is_none() && update.kind.is_none() && update.metadata.is_none() && embedding.is_none() {
        let exists = sqlx::query("SELECT 1 FROM memory_chunks WHERE tenant_id = $1 AND user_id = $2 AND id = $3")
            .bind(tenant_id)
            .bind(user_id)
            .bind(id)
            .fetch_optional(conn)
            .await?;
        return exists.map(|_| ()).ok_or_else(|| memory_not_found(id));
    }

    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE memory_chunks SET updated_at = NOW()");
    if let Some(text) = update.text {
        qb.push(", text = ");
        qb.push_bind(text);
    }
    if let Some(kind) = update.kind {
        qb.push(", kind = ");
        qb.push_bind(kind.as_str());
    }
    if let Some(metadata) = update.metadata {
        qb.push(", metadata = ");
        qb.push_bind(serde_json::Value::Object(metadata));
    }
    if let Some(embedding) = embedding {
        qb.push(", embedding = ");
        qb.push_bind(pgvector::Vector::from(embedding));
    }
    qb.push(" WHERE tenant_id = ");
    qb.push_bind(tenant_id.to_string());
    qb.push(" AND user_id = ");
    qb.push_bind(user_id);
    qb.push(" AND id = ");
    qb.push_bind(id);

    let result = qb.build().execute(conn).await?;
    if result.rows_affected() == 0 {
        return Err(memory_not_found(id));
    }
    Ok(())
}

pub(crate) async fn delete_record(conn: &mut PgConnection, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<()> {
    let result = sqlx::query("DELETE FROM memory_chunks WHERE tenant_id = $1 AND user_id = $2 AND id = $3")
        .bind(tenant_id)
        .bind(user_id)
        .bind(id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(memory_not_found(id));
    }
    Ok(())
}
