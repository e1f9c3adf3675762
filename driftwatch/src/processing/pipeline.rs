use std::sync::Arc;

use crate::analysis::{AnalyzeOptions, CrossChatLinker, EnsembleSegmenter};
use crate::db::DatabaseBackend;
use crate::error::{DriftError, Result};
use crate::models::{Conversation, DivergenceReport};

/// Result of processing one claimed conversation.
#[derive(Debug)]
pub enum ProcessOutcome {
    Analyzed {
        report: Box<DivergenceReport>,
        links: usize,
    },
    /// The conversation has no messages; nothing was written.
    Skipped,
}

/// Per-conversation analysis routine shared by compute, backfill and the
/// background workers.
#[derive(Clone)]
pub struct DivergencePipeline {
    db: Arc<dyn DatabaseBackend>,
    segmenter: EnsembleSegmenter,
    linker: CrossChatLinker,
}

impl DivergencePipeline {
    pub fn new(db: Arc<dyn DatabaseBackend>, segmenter: EnsembleSegmenter) -> Self {
        let linker = CrossChatLinker::new(segmenter.config().linker.clone());
        Self {
            db,
            segmenter,
            linker,
        }
    }

    pub fn segmenter(&self) -> &EnsembleSegmenter {
        &self.segmenter
    }

    pub fn linker(&self) -> &CrossChatLinker {
        &self.linker
    }

    /// Analyze without touching the store.
    pub async fn analyze(
        &self,
        conversation: &Conversation,
        options: &AnalyzeOptions,
    ) -> Result<DivergenceReport> {
        self.segmenter.analyze(conversation, options).await
    }

    /// Replace the conversation's links with fresh ones against every other
    /// conversation's anchors of the same model.
    pub async fn link(&self, conversation: &Conversation, report: &DivergenceReport) -> Result<usize> {
        let dim = report
            .segments
            .iter()
            .map(|s| s.anchor_embedding.len())
            .find(|&len| len > 0)
            .unwrap_or(0);
        if dim == 0 {
            self.db.replace_links(&conversation.id, &[]).await?;
            return Ok(0);
        }

        let anchors = self
            .db
            .list_segment_anchors(&report.embedding_model, dim, Some(&conversation.id))
            .await?;
        let links = self
            .linker
            .link_segments(conversation.created_at, &report.segments, &anchors);

        self.db.replace_links(&conversation.id, &links).await?;
        Ok(links.len())
    }

    async fn run(&self, conversation_id: &str, options: &AnalyzeOptions) -> Result<ProcessOutcome> {
        let conversation = self
            .db
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DriftError::NotFound(format!("Conversation {conversation_id} not found")))?;

        if conversation.messages.is_empty() {
            tracing::debug!(conversation_id, "Skipping empty conversation");
            return Ok(ProcessOutcome::Skipped);
        }

        let report = self.analyze(&conversation, options).await?;
        self.db.save_analysis(&report).await?;

        let links = match self.link(&conversation, &report).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(conversation_id, error = %err, "Cross-chat linking failed");
                0
            }
        };

        Ok(ProcessOutcome::Analyzed {
            report: Box::new(report),
            links,
        })
    }

    /// Process a queue entry the caller has already claimed, then close it.
    /// Failures are recorded on the entry before being returned.
    pub async fn process_claimed(
        &self,
        conversation_id: &str,
        options: &AnalyzeOptions,
    ) -> Result<ProcessOutcome> {
        match self.run(conversation_id, options).await {
            Ok(outcome) => {
                let status = self.db.complete(conversation_id).await?;
                tracing::debug!(conversation_id, status = %status, "Queue entry closed");
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(conversation_id, error = %err, "Divergence processing failed");
                if let Err(queue_err) = self.db.fail(conversation_id, &err.to_string()).await {
                    tracing::error!(
                        conversation_id,
                        error = %queue_err,
                        "Failed to record processing failure"
                    );
                }
                Err(err)
            }
        }
    }
}
