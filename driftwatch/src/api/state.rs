use std::sync::Arc;

use crate::config::Config;
use crate::db::DatabaseBackend;
use crate::embeddings::Embedder;
use crate::llm::LlmProvider;
use crate::services::DivergenceService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn DatabaseBackend>,
    pub embeddings: Arc<dyn Embedder>,
    pub llm: Arc<LlmProvider>,
    pub divergence: DivergenceService,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Arc<dyn DatabaseBackend>,
        embeddings: Arc<dyn Embedder>,
        llm: Arc<LlmProvider>,
    ) -> Self {
        let divergence = DivergenceService::new(
            &config,
            Arc::clone(&db),
            Arc::clone(&embeddings),
            Arc::clone(&llm),
        );

        Self {
            config: Arc::new(config),
            db,
            embeddings,
            llm,
            divergence,
        }
    }
}
