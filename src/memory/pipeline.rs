//! Memory pipeline: embedding, chunking, search post-processing and context
//! assembly in front of a [`MemoryStore`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    MemoryBackend, MemoryHit, MemoryKind, MemoryRecord, MemoryStore, MemoryUpdate, Metadata, NewMemory,
    SearchOptions, context, rerank,
};
use crate::error::{CoreError, CoreResult, cancellable};
use crate::llm::LlmProvider;
use crate::telemetry::sanitize_text;

/// Pipeline tuning, normally taken from the `memory` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_context_tokens: usize,
    pub default_top_k: usize,
    pub default_min_score: f32,
    /// Characters per chunk.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub chunk_overlap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 2000,
            default_top_k: 5,
            default_min_score: 0.7,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// A memory to store, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryItem {
    pub kind: MemoryKind,
    pub text: String,
    pub metadata: Metadata,
}

impl MemoryItem {
    pub fn new(kind: MemoryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryPipeline {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn LlmProvider>,
    config: PipelineConfig,
}

impl std::fmt::Debug for MemoryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPipeline")
            .field("backend", &self.store.backend())
            .field("embedder", &self.embedder.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Split `text` into windows of `size` characters, each starting
/// `size - overlap` characters after the previous one.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = size.max(1);
    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

impl MemoryPipeline {
    pub fn new(store: Arc<dyn MemoryStore>, embedder: Arc<dyn LlmProvider>, config: PipelineConfig) -> Self {
        Self { store, embedder, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> MemoryBackend {
        self.store.backend()
    }

    pub fn memory_store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    async fn embed_all(&self, texts: &[String], cancel: &CancellationToken) -> CoreResult<Vec<Vec<f32>>> {
        let vectors = self.embedder.embed(texts, cancel).await.map_err(|e| match e {
            CoreError::Cancelled | CoreError::EmbeddingFailed(_) => e,
            other => CoreError::EmbeddingFailed(other.to_string()),
        })?;
        if vectors.len() != texts.len() || vectors.iter().any(Vec::is_empty) {
            return Err(CoreError::EmbeddingFailed("no embeddings generated".to_string()));
        }
        Ok(vectors)
    }

    async fn embed_one(&self, text: &str, cancel: &CancellationToken) -> CoreResult<Vec<f32>> {
        self.embed_all(&[text.to_string()], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::EmbeddingFailed("no embeddings generated".to_string()))
    }

    /// Embed and persist one memory, chunking long text.
    ///
    /// Returns the id of the first stored record.
    #[instrument(skip(self, item, cancel), fields(kind = %item.kind))]
    pub async fn store(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        item: MemoryItem,
        cancel: &CancellationToken,
    ) -> CoreResult<Uuid> {
        let start = Instant::now();
        debug!(text = %sanitize_text(&item.text), "storing memory item");

        let embedding = self.embed_one(&item.text, cancel).await?;

        let now = Utc::now().to_rfc3339();
        let mut metadata = item.metadata;
        metadata.insert("stored_at".into(), now.clone().into());
        metadata.entry("created_at").or_insert_with(|| now.into());

        let text_len = item.text.chars().count();
        let records = if text_len > self.config.chunk_size {
            let chunks = chunk_text(&item.text, self.config.chunk_size, self.config.chunk_overlap);
            let embeddings = self.embed_all(&chunks, cancel).await?;
            let chunk_count = chunks.len();

            chunks
                .into_iter()
                .zip(embeddings)
                .enumerate()
                .map(|(index, (text, embedding))| {
                    let mut chunk_metadata = metadata.clone();
                    chunk_metadata.insert("chunk_index".into(), index.into());
                    chunk_metadata.insert("chunk_count".into(), chunk_count.into());
                    chunk_metadata.insert("parent_text_length".into(), text_len.into());
                    NewMemory {
                        id: None,
                        kind: item.kind,
                        text,
                        embedding,
                        metadata: chunk_metadata,
                    }
                })
                .collect()
        } else {
            vec![NewMemory {
                id: None,
                kind: item.kind,
                text: item.text,
                embedding,
                metadata,
            }]
        };

        let chunks = records.len();
        let ids = cancellable(cancel, self.store.upsert(tenant_id, user_id, records)).await?;
        let first = ids
            .first()
            .copied()
            .ok_or_else(|| CoreError::StorageUnavailable("no items were stored".to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            name: "memory.stored",
            tenant_id = %tenant_id,
            id = %first,
            chunks,
            duration_ms,
            "memory item stored successfully"
        );
        Ok(first)
    }

    /// Similarity search followed by dedup, query boosts and a re-sort.
    ///
    /// `options` defaults to the configured `top_k` and `min_score`.
    #[instrument(skip(self, query, options, cancel))]
    pub async fn search(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        query: &str,
        options: Option<SearchOptions>,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<MemoryHit>> {
        let start = Instant::now();
        let mut options = options.unwrap_or_else(|| SearchOptions {
            top_k: self.config.default_top_k,
            min_score: self.config.default_min_score,
            ..SearchOptions::default()
        });
        if options.query_text.is_none() {
            options.query_text = Some(query.to_string());
        }

        debug!(
            query = %sanitize_text(query),
            top_k = options.top_k,
            min_score = options.min_score,
            "searching memory"
        );

        let embedding = self.embed_one(query, cancel).await?;
        let hits = cancellable(cancel, self.store.search(tenant_id, user_id, &embedding, &options)).await?;

        let mut hits = rerank::deduplicate(hits);
        rerank::apply_query_boosts(&mut hits, query, Utc::now());
        rerank::sort_by_score(&mut hits);

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            tenant_id = %tenant_id,
            backend = %self.store.backend(),
            hits = hits.len(),
            duration_ms,
            "memory search completed"
        );
        Ok(hits)
    }

    /// Render hits within `max_tokens`, or the configured budget when `None`.
    pub fn build_context(&self, hits: &[MemoryHit], max_tokens: Option<usize>) -> String {
        let budget = max_tokens
            .filter(|t| *t > 0)
            .unwrap_or(self.config.max_context_tokens);
        context::build_context(hits, budget)
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> CoreResult<MemoryRecord> {
        cancellable(cancel, self.store.get_by_id(tenant_id, user_id, id)).await
    }

    /// Partial update; a new `text` is re-embedded before it is written.
    pub async fn update(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        id: Uuid,
        mut update: MemoryUpdate,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        if let Some(text) = &update.text {
            if update.embedding.is_none() && self.store.backend() != MemoryBackend::SqlFallback {
                update.embedding = Some(self.embed_one(text, cancel).await?);
            }
        }
        cancellable(cancel, self.store.update_by_id(tenant_id, user_id, id, update)).await
    }

    pub async fn delete(
        &self,
        tenant_id: &str,
        user_id: Uuid,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        cancellable(cancel, self.store.delete_by_id(tenant_id, user_id, id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::memory::InMemoryStore;

    fn pipeline(config: PipelineConfig) -> (MemoryPipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = MemoryPipeline::new(store.clone(), Arc::new(MockProvider::new()), config);
        (pipeline, store)
    }

    #[test]
    fn test_chunking_windows() {
        let chunks = chunk_text("abcdefghij", 4, 1);
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunk_text("short", 10, 2), vec!["short"]);
    }

    #[test]
    fn test_chunking_never_splits_code_points() {
        let chunks = chunk_text("ééééé", 2, 0);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_overlap_not_smaller_than_size_still_advances() {
        let chunks = chunk_text("abcdef", 2, 5);
        assert_eq!(chunks.len(), 5);
    }

    #[tokio::test]
    async fn test_store_short_text_is_single_record() {
        let (pipeline, store) = pipeline(PipelineConfig::default());
        let user = Uuid::new_v4();
        let token = CancellationToken::new();
        let id = pipeline
            .store("t1", user, MemoryItem::new(MemoryKind::Task, "buy milk"), &token)
            .await
            .unwrap();

        let record = store.get_by_id("t1", user, id).await.unwrap();
        assert_eq!(record.text, "buy milk");
        assert!(record.metadata.contains_key("stored_at"));
        assert!(record.metadata.contains_key("created_at"));
        assert!(!record.metadata.contains_key("chunk_index"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_long_text_chunks_with_bookkeeping() {
        let config = PipelineConfig {
            chunk_size: 100,
            chunk_overlap: 20,
            ..PipelineConfig::default()
        };
        let (pipeline, store) = pipeline(config);
        let user = Uuid::new_v4();
        let text = "lorem ipsum ".repeat(25);
        let token = CancellationToken::new();

        pipeline
            .store("t1", user, MemoryItem::new(MemoryKind::Note, text.clone()), &token)
            .await
            .unwrap();

        let records = store.search("t1", user, &[0.0; 64], &SearchOptions { top_k: 0, ..SearchOptions::default() }).await.unwrap();
        assert_eq!(records.len(), 4);

        let mut indices: Vec<u64> = records
            .iter()
            .map(|r| r.metadata["chunk_index"].as_u64().unwrap())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for r in &records {
            assert_eq!(r.metadata["chunk_count"], 4);
            assert_eq!(r.metadata["parent_text_length"], 300);
        }
    }

    #[tokio::test]
    async fn test_store_fails_when_embeddings_fail() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = MemoryPipeline::new(
            store,
            Arc::new(MockProvider::new().failing_embeddings()),
            PipelineConfig::default(),
        );
        let err = pipeline
            .store("t1", Uuid::new_v4(), MemoryItem::new(MemoryKind::Note, "x"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::EmbeddingFailed(_)));
    }

    #[tokio::test]
    async fn test_search_finds_and_deduplicates() {
        let (pipeline, _store) = pipeline(PipelineConfig::default());
        let user = Uuid::new_v4();
        let token = CancellationToken::new();
        for text in ["buy milk", "Buy milk", "walk the dog"] {
            pipeline
                .store("t1", user, MemoryItem::new(MemoryKind::Task, text), &token)
                .await
                .unwrap();
        }

        let options = SearchOptions {
            top_k: 5,
            min_score: 0.6,
            ..SearchOptions::default()
        };
        let hits = pipeline.search("t1", user, "milk", Some(options), &token).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text.to_lowercase(), "buy milk");
    }

    #[tokio::test]
    async fn test_update_text_re_embeds() {
        let (pipeline, store) = pipeline(PipelineConfig::default());
        let user = Uuid::new_v4();
        let token = CancellationToken::new();
        let id = pipeline
            .store("t1", user, MemoryItem::new(MemoryKind::Note, "old words"), &token)
            .await
            .unwrap();
        let before = store.get_by_id("t1", user, id).await.unwrap().embedding;

        pipeline
            .update(
                "t1",
                user,
                id,
                MemoryUpdate {
                    text: Some("completely different".to_string()),
                    ..MemoryUpdate::default()
                },
                &token,
            )
            .await
            .unwrap();

        let after = store.get_by_id("t1", user, id).await.unwrap();
        assert_eq!(after.text, "completely different");
        assert_ne!(after.embedding, before);
    }

    #[tokio::test]
    async fn test_cancelled_search_surfaces_cancellation() {
        let (pipeline, _store) = pipeline(PipelineConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let err = pipeline
            .search("t1", Uuid::new_v4(), "milk", None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[test]
    fn test_build_context_uses_configured_budget() {
        let (pipeline, _store) = pipeline(PipelineConfig::default());
        assert_eq!(pipeline.build_context(&[], None), "");
    }
}
