use std::sync::Arc;

use crate::config::ProcessingConfig;
use crate::db::DatabaseBackend;
use crate::error::Result;
use crate::models::EnqueueOutcome;

/// Enqueue-only callbacks for the ingestion collaborator and the file
/// watcher. Neither runs analysis inline.
#[derive(Clone)]
pub struct IngestionHooks {
    db: Arc<dyn DatabaseBackend>,
    ingest_priority: i64,
    watcher_priority: i64,
}

impl IngestionHooks {
    pub fn new(db: Arc<dyn DatabaseBackend>, config: &ProcessingConfig) -> Self {
        Self {
            db,
            ingest_priority: config.ingest_priority,
            watcher_priority: config.watcher_priority,
        }
    }

    /// Called after ingestion commits a new or updated conversation.
    pub async fn on_conversation_ingested(&self, conversation_id: &str) -> Result<EnqueueOutcome> {
        let outcome = self.db.enqueue(conversation_id, self.ingest_priority).await?;
        tracing::debug!(conversation_id, ?outcome, "Ingestion hook");
        Ok(outcome)
    }

    /// Called by the change watcher when a conversation's source changed.
    pub async fn on_watcher_change(&self, conversation_id: &str) -> Result<EnqueueOutcome> {
        let outcome = self.db.enqueue(conversation_id, self.watcher_priority).await?;
        tracing::debug!(conversation_id, ?outcome, "Watcher hook");
        Ok(outcome)
    }
}
