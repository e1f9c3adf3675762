use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Conversation, DivergenceReport, EnqueueOutcome, PollCheckpoint, QueueEntry, QueueStats,
    QueueStatus, ReportSummary, Segment, SegmentAnchor, SegmentLink,
};

use super::repository::ReportAggregates;

/// Read/write access to conversations supplied by the ingestion collaborator.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    async fn delete_conversation(&self, id: &str) -> Result<bool>;
    /// Conversations after `since` in `(updated_at, id)` order.
    async fn list_conversations_updated_since(
        &self,
        since: Option<&PollCheckpoint>,
        limit: usize,
    ) -> Result<Vec<PollCheckpoint>>;
    async fn list_conversation_ids_page(
        &self,
        after: Option<&str>,
        limit: usize,
        only_missing_report: bool,
    ) -> Result<Vec<String>>;
    async fn count_conversations(&self) -> Result<u64>;
}

/// Segment and report rows owned by the ensemble segmenter.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Atomically replace the conversation's segments and report.
    async fn save_analysis(&self, report: &DivergenceReport) -> Result<()>;
    async fn get_report(&self, conversation_id: &str) -> Result<Option<DivergenceReport>>;
    async fn has_report(&self, conversation_id: &str) -> Result<bool>;
    async fn list_high_divergence(&self, threshold: f64, limit: usize)
        -> Result<Vec<ReportSummary>>;
    async fn report_aggregates(&self, high_threshold: f64) -> Result<ReportAggregates>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    async fn get_segments(&self, conversation_id: &str) -> Result<Vec<Segment>>;
    async fn list_segment_anchors(
        &self,
        embedding_model: &str,
        embedding_dim: usize,
        exclude_conversation: Option<&str>,
    ) -> Result<Vec<SegmentAnchor>>;
    async fn count_segments(&self) -> Result<u64>;
    async fn count_stale_segments(&self, current_model: &str) -> Result<u64>;
    async fn conversations_with_stale_model(&self, current_model: &str) -> Result<Vec<String>>;
}

/// Link rows owned by the cross-chat linker.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn replace_links(&self, conversation_id: &str, links: &[SegmentLink]) -> Result<()>;
    async fn get_links(&self, conversation_id: &str) -> Result<Vec<SegmentLink>>;
    async fn count_links(&self) -> Result<u64>;
}

/// Durable processing queue owned by the pipeline.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, conversation_id: &str, priority: i64) -> Result<EnqueueOutcome>;
    /// Enqueue for a change seen at `changed_at`, leaving entries cancelled
    /// after that change alone.
    async fn enqueue_change(
        &self,
        conversation_id: &str,
        priority: i64,
        changed_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;
    async fn claim(&self, conversation_id: &str) -> Result<bool>;
    async fn claim_next(&self, limit: usize) -> Result<Vec<QueueEntry>>;
    async fn complete(&self, conversation_id: &str) -> Result<QueueStatus>;
    async fn fail(&self, conversation_id: &str, error: &str) -> Result<QueueStatus>;
    async fn cancel(&self, conversation_id: &str) -> Result<bool>;
    async fn get_queue_entry(&self, conversation_id: &str) -> Result<Option<QueueEntry>>;
    async fn queue_stats(&self) -> Result<QueueStats>;
    async fn reset_stale_processing(&self, started_before: DateTime<Utc>) -> Result<u64>;
    async fn clear_completed(&self) -> Result<u64>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_poll_checkpoint(&self) -> Result<Option<PollCheckpoint>>;
    async fn set_poll_checkpoint(&self, checkpoint: &PollCheckpoint) -> Result<()>;
    async fn get_embedding_model(&self) -> Result<Option<String>>;
    async fn set_embedding_model(&self, model: &str) -> Result<()>;
}

/// Everything the service layer needs from a storage engine.
#[async_trait]
pub trait DatabaseBackend:
    ConversationStore + ReportStore + SegmentStore + LinkStore + QueueStore + MetadataStore
{
    async fn sync(&self) -> Result<()>;
}
