//! Process-local memory store.
//!
//! Holds records in a map and scores them with cosine similarity on every
//! search. Used for `in_memory` tenants and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{
    MemoryBackend, MemoryHit, MemoryRecord, MemoryStore, MemoryUpdate, NewMemory, SearchOptions,
    memory_not_found,
};
use crate::error::CoreResult;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<Uuid, MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn owned_by(record: &MemoryRecord, tenant_id: &str, user_id: Uuid) -> bool {
    record.tenant_id == tenant_id && record.user_id == user_id
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    fn backend(&self) -> MemoryBackend {
        MemoryBackend::InMemory
    }

    async fn upsert(&self, tenant_id: &str, user_id: Uuid, records: Vec<NewMemory>) -> CoreResult<Vec<Uuid>> {
        let now = Utc::now();
        let mut map = self.records.write().await;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let id = record.id.unwrap_or_else(Uuid::new_v4);
            let created_at = map.get(&id).map_or(now, |existing| existing.created_at);
            map.insert(
                id,
                MemoryRecord {
                    id,
                    tenant_id: tenant_id.to_string(),
                    user_id,
                    kind: record.kind,
                    text: record.text,
                    embedding: record.embedding,
                    metadata: record.metadata,
                    created_at,
                    updated_at: now,
                },
            );
            ids.push(id);
        }

        debug!(tenant_id = %tenant_id, count = ids.len(), "memory items upserted");
        Ok(ids)
    }

    async fn search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        query_embedding: &[f32],
        options: &SearchOptions,
    ) -> CoreResult<Vec<MemoryHit>> {
        let map = self.records.read().await;

        let mut hits: Vec<MemoryHit> = map
            .values()
            .filter(|r| owned_by(r, tenant_id, user_id))
            .filter(|r| options.filter.matches(r.kind, &r.metadata))
            .map(|r| MemoryHit {
                id: r.id,
                kind: r.kind,
                text: r.text.clone(),
                score: cosine_similarity(&r.embedding, query_embedding),
                metadata: r.metadata.clone(),
            })
            .filter(|hit| options.min_score <= 0.0 || hit.score >= options.min_score)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if options.top_k > 0 {
            hits.truncate(options.top_k);
        }

        debug!(tenant_id = %tenant_id, hits = hits.len(), "similarity search completed");
        Ok(hits)
    }

    async fn get_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<MemoryRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .filter(|r| owned_by(r, tenant_id, user_id))
            .cloned()
            .ok_or_else(|| memory_not_found(id))
    }

    async fn update_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid, update: MemoryUpdate) -> CoreResult<()> {
        let mut map = self.records.write().await;
        let record = map
            .get_mut(&id)
            .filter(|r| owned_by(r, tenant_id, user_id))
            .ok_or_else(|| memory_not_found(id))?;

        if update.is_empty() {
            return Ok(());
        }
        if let Some(text) = update.text {
            record.text = text;
        }
        if let Some(kind) = update.kind {
            record.kind = kind;
        }
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        if let Some(embedding) = update.embedding {
            record.embedding = embedding;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_by_id(&self, tenant_id: &str, user_id: Uuid, id: Uuid) -> CoreResult<()> {
        let mut map = self.records.write().await;
        match map.get(&id) {
            Some(r) if owned_by(r, tenant_id, user_id) => {
                map.remove(&id);
                Ok(())
            }
            _ => Err(memory_not_found(id)),
        }
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Cosine similarity; zero when either vector has no magnitude or the
/// dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
