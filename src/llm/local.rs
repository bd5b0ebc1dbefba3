//! In-process embeddings via `fastembed`.
//!
//! Selected by an embedding model id of the form `local:<model>`. The ONNX
//! model is loaded on first use and then kept for the life of the provider.

use std::sync::Arc;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{CoreError, CoreResult};

pub const LOCAL_MODEL_PREFIX: &str = "local:";

pub struct LocalEmbedder {
    model_id: String,
    model: EmbeddingModel,
    loaded: Arc<Mutex<Option<TextEmbedding>>>,
}

impl std::fmt::Debug for LocalEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbedder")
            .field("model_id", &self.model_id)
            .field("loaded", &"Dynamic")
            .finish_non_exhaustive()
    }
}

impl LocalEmbedder {
    /// Resolve a model name (without the `local:` prefix).
    pub fn new(model_id: &str) -> CoreResult<Self> {
        let model = match model_id.to_lowercase().as_str() {
            "bge-small-en-v1.5" | "bge-small" => EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" | "bge-base" => EmbeddingModel::BGEBaseENV15,
            "all-minilm-l6-v2" | "minilm" => EmbeddingModel::AllMiniLML6V2,
            other => {
                return Err(CoreError::Config(format!(
                    "unknown local embedding model: {other}"
                )));
            }
        };

        Ok(Self {
            model_id: model_id.to_string(),
            model,
            loaded: Arc::new(Mutex::new(None)),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Embed a batch on the blocking pool, loading the model first if needed.
    pub async fn embed(&self, texts: Vec<String>) -> CoreResult<Vec<Vec<f32>>> {
        let mut guard = self.loaded.lock().await;

        let mut owned = match guard.take() {
            Some(model) => model,
            None => {
                info!(model = %self.model_id, "Initializing fastembed model...");
                let model = self.model.clone();
                tokio::task::spawn_blocking(move || {
                    let mut options = InitOptions::new(model);
                    options.show_download_progress = false;
                    TextEmbedding::try_new(options)
                })
                .await
                .map_err(|e| CoreError::EmbeddingFailed(e.to_string()))?
                .map_err(|e| CoreError::EmbeddingFailed(format!("model load failed: {e}")))?
            }
        };

        let expected = texts.len();
        let (result, returned) = tokio::task::spawn_blocking(move || {
            let res = owned.embed(texts, None);
            (res, owned)
        })
        .await
        .map_err(|e| CoreError::EmbeddingFailed(e.to_string()))?;

        *guard = Some(returned);

        let vectors = result.map_err(|e| CoreError::EmbeddingFailed(e.to_string()))?;
        if vectors.len() != expected {
            return Err(CoreError::EmbeddingFailed(format!(
                "expected {expected} embeddings, got {}",
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_names_resolve() {
        assert!(LocalEmbedder::new("bge-small-en-v1.5").is_ok());
        assert!(LocalEmbedder::new("MiniLM").is_ok());
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        assert!(matches!(
            LocalEmbedder::new("word2vec"),
            Err(CoreError::Config(_))
        ));
    }
}
