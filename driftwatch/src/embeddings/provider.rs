use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::config::{parse_provider_model, EmbeddingsConfig};
use crate::error::{DriftError, Result};

use super::api::EmbeddingApiClient;

/// Source of message embeddings. Analyzers are generic over this so the
/// model can be swapped without touching analysis code.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
    /// Version tag stored next to every persisted vector.
    fn model_id(&self) -> &str;
}

type SharedModel = Arc<Mutex<TextEmbedding>>;

#[derive(Clone)]
enum EmbeddingBackend {
    Local {
        model: EmbeddingModel,
        loaded: Arc<RwLock<Option<SharedModel>>>,
        batch_size: usize,
    },
    Api(EmbeddingApiClient),
}

/// Shared embedding service. Local models load once on first use (or on
/// [`EmbeddingProvider::init`]) and are read-only afterwards; clones share
/// the same instance.
#[derive(Clone)]
pub struct EmbeddingProvider {
    backend: EmbeddingBackend,
    dimensions: usize,
    model_id: String,
}

impl EmbeddingProvider {
    /// Does not load anything; local weights are fetched lazily.
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let (provider, model_name) = parse_provider_model(&config.model);

        let backend = if provider.eq_ignore_ascii_case("local") {
            EmbeddingBackend::Local {
                model: resolve_embedding_model(model_name),
                loaded: Arc::new(RwLock::new(None)),
                batch_size: config.batch_size.max(1),
            }
        } else {
            EmbeddingBackend::Api(EmbeddingApiClient::new(config)?)
        };

        Ok(Self {
            backend,
            dimensions: config.dimensions,
            model_id: config.model.clone(),
        })
    }

    /// Eagerly load the local model, or call the API once to check the
    /// configured dimensions.
    pub async fn init(&self) -> Result<()> {
        match &self.backend {
            EmbeddingBackend::Local { .. } => {
                self.local_model().await?;
            }
            EmbeddingBackend::Api(client) => {
                let detected = client.detect_dimensions().await?;
                if detected != self.dimensions {
                    tracing::warn!(
                        model = %self.model_id,
                        configured = self.dimensions,
                        detected,
                        "Embedding API dimensions differ from EMBEDDING_DIMENSIONS"
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop the loaded local model. The next embed call reloads it.
    pub async fn shutdown(&self) {
        if let EmbeddingBackend::Local { loaded, .. } = &self.backend {
            loaded.write().await.take();
            tracing::info!(model = %self.model_id, "Embedding model unloaded");
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, EmbeddingBackend::Local { .. })
    }

    async fn local_model(&self) -> Result<SharedModel> {
        let EmbeddingBackend::Local { model, loaded, .. } = &self.backend else {
            return Err(DriftError::Internal(
                "local model requested from API backend".to_string(),
            ));
        };

        if let Some(existing) = loaded.read().await.as_ref() {
            return Ok(Arc::clone(existing));
        }

        let mut slot = loaded.write().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }

        tracing::info!(model = %self.model_id, "Loading embedding model");
        let model = model.clone();
        let built = tokio::task::spawn_blocking(move || build_model(model))
            .await
            .map_err(|e| DriftError::ModelUnavailable(format!("Model loader failed: {e}")))??;

        let shared = Arc::new(Mutex::new(built));
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let expected = texts.len();
        let embeddings = match &self.backend {
            EmbeddingBackend::Local { batch_size, .. } => {
                let model = self.local_model().await?;
                let batch_size = *batch_size;
                tokio::task::spawn_blocking(move || {
                    let mut model = model.lock().map_err(|e| {
                        DriftError::Embedding(format!("Embedding model lock poisoned: {e}"))
                    })?;
                    model
                        .embed(texts, Some(batch_size))
                        .map_err(|e| DriftError::Embedding(e.to_string()))
                })
                .await
                .map_err(|e| DriftError::Embedding(format!("Embedding worker failed: {e}")))??
            }
            EmbeddingBackend::Api(client) => client.embed(&texts).await?,
        };

        if embeddings.len() != expected {
            return Err(DriftError::Embedding(format!(
                "Expected {expected} embeddings, got {}",
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        EmbeddingProvider::embed(self, texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn resolve_embedding_model(model_name: &str) -> EmbeddingModel {
    match model_name {
        "BAAI/bge-small-en-v1.5" | "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" | "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "BAAI/bge-large-en-v1.5" | "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "all-MiniLM-L6-v2" | "sentence-transformers/all-MiniLM-L6-v2" => {
            EmbeddingModel::AllMiniLML6V2
        }
        "all-MiniLM-L12-v2" | "sentence-transformers/all-MiniLM-L12-v2" => {
            EmbeddingModel::AllMiniLML12V2
        }
        "nomic-embed-text-v1.5" | "nomic-ai/nomic-embed-text-v1.5" => {
            EmbeddingModel::NomicEmbedTextV15
        }
        other => {
            tracing::warn!(model = other, "Unknown embedding model, using all-MiniLM-L6-v2");
            EmbeddingModel::AllMiniLML6V2
        }
    }
}

fn build_model(embedding_model: EmbeddingModel) -> Result<TextEmbedding> {
    TextEmbedding::try_new(InitOptions::new(embedding_model).with_show_download_progress(false))
        .map_err(|e| DriftError::ModelUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_config(base_url: &str) -> EmbeddingsConfig {
        EmbeddingsConfig {
            model: "openai/text-embedding-3-small".to_string(),
            dimensions: 3,
            batch_size: 2,
            api_key: Some("test-key".to_string()),
            base_url: Some(base_url.to_string()),
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    #[test]
    fn test_local_provider_is_lazy() {
        let config = EmbeddingsConfig {
            model: "all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            batch_size: 16,
            api_key: None,
            base_url: None,
            timeout_secs: 30,
            max_retries: 0,
        };
        let provider = EmbeddingProvider::new(&config).expect("construction never loads weights");
        assert!(provider.is_local());
        assert_eq!(provider.model_id(), "all-MiniLM-L6-v2");
        assert_eq!(provider.dimensions(), 384);
    }

    #[test]
    fn test_api_provider_keeps_full_model_tag() {
        let provider = EmbeddingProvider::new(&api_config("http://localhost:9")).unwrap();
        assert!(!provider.is_local());
        assert_eq!(provider.model_id(), "openai/text-embedding-3-small");
    }

    #[tokio::test]
    async fn test_empty_input_needs_no_backend() {
        let provider = EmbeddingProvider::new(&api_config("http://localhost:9")).unwrap();
        let embeddings = provider.embed(Vec::new()).await.unwrap();
        assert!(embeddings.is_empty());
    }
}
