use crate::db::connection::Database;
use crate::db::repository::{
    ConversationRepository, LinkRepository, QueueRepository, ReportAggregates, ReportRepository,
    SegmentRepository,
};
use crate::db::traits::{
    ConversationStore, DatabaseBackend, LinkStore, MetadataStore, QueueStore, ReportStore,
    SegmentStore,
};
use crate::db::MetadataRepository;
use crate::error::Result;
use crate::models::{
    Conversation, DivergenceReport, EnqueueOutcome, PollCheckpoint, QueueEntry, QueueStats,
    QueueStatus, ReportSummary, Segment, SegmentAnchor, SegmentLink,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub struct LibSqlBackend {
    db: Database,
}

impl LibSqlBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.db.connect().await?;
        ConversationRepository::upsert(&conn, conversation).await
    }
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.db.connect().await?;
        ConversationRepository::get_by_id(&conn, id).await
    }
    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.db.connect().await?;
        ConversationRepository::delete(&conn, id).await
    }
    async fn list_conversations_updated_since(
        &self,
        since: Option<&PollCheckpoint>,
        limit: usize,
    ) -> Result<Vec<PollCheckpoint>> {
        let conn = self.db.connect().await?;
        ConversationRepository::list_updated_since(&conn, since, limit).await
    }
    async fn list_conversation_ids_page(
        &self,
        after: Option<&str>,
        limit: usize,
        only_missing_report: bool,
    ) -> Result<Vec<String>> {
        let conn = self.db.connect().await?;
        ConversationRepository::list_ids_page(&conn, after, limit, only_missing_report).await
    }
    async fn count_conversations(&self) -> Result<u64> {
        let conn = self.db.connect().await?;
        ConversationRepository::count(&conn).await
    }
}

#[async_trait]
impl ReportStore for LibSqlBackend {
    async fn save_analysis(&self, report: &DivergenceReport) -> Result<()> {
        let conn = self.db.connect().await?;
        ReportRepository::save_analysis(&conn, report).await
    }
    async fn get_report(&self, conversation_id: &str) -> Result<Option<DivergenceReport>> {
        let conn = self.db.connect().await?;
        ReportRepository::get_by_conversation(&conn, conversation_id).await
    }
    async fn has_report(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.db.connect().await?;
        ReportRepository::exists(&conn, conversation_id).await
    }
    async fn list_high_divergence(
        &self,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ReportSummary>> {
        let conn = self.db.connect().await?;
        ReportRepository::list_high_divergence(&conn, threshold, limit).await
    }
    async fn report_aggregates(&self, high_threshold: f64) -> Result<ReportAggregates> {
        let conn = self.db.connect().await?;
        ReportRepository::aggregates(&conn, high_threshold).await
    }
}

#[async_trait]
impl SegmentStore for LibSqlBackend {
    async fn get_segments(&self, conversation_id: &str) -> Result<Vec<Segment>> {
        let conn = self.db.connect().await?;
        SegmentRepository::get_by_conversation(&conn, conversation_id).await
    }
    async fn list_segment_anchors(
        &self,
        embedding_model: &str,
        embedding_dim: usize,
        exclude_conversation: Option<&str>,
    ) -> Result<Vec<SegmentAnchor>> {
        let conn = self.db.connect().await?;
        SegmentRepository::list_anchors(&conn, embedding_model, embedding_dim, exclude_conversation)
            .await
    }
    async fn count_segments(&self) -> Result<u64> {
        let conn = self.db.connect().await?;
        SegmentRepository::count(&conn).await
    }
    async fn count_stale_segments(&self, current_model: &str) -> Result<u64> {
        let conn = self.db.connect().await?;
        SegmentRepository::count_stale(&conn, current_model).await
    }
    async fn conversations_with_stale_model(&self, current_model: &str) -> Result<Vec<String>> {
        let conn = self.db.connect().await?;
        SegmentRepository::conversations_with_stale_model(&conn, current_model).await
    }
}

#[async_trait]
impl LinkStore for LibSqlBackend {
    async fn replace_links(&self, conversation_id: &str, links: &[SegmentLink]) -> Result<()> {
        let conn = self.db.connect().await?;
        LinkRepository::replace_for_conversation(&conn, conversation_id, links).await
    }
    async fn get_links(&self, conversation_id: &str) -> Result<Vec<SegmentLink>> {
        let conn = self.db.connect().await?;
        LinkRepository::get_by_conversation(&conn, conversation_id).await
    }
    async fn count_links(&self) -> Result<u64> {
        let conn = self.db.connect().await?;
        LinkRepository::count(&conn).await
    }
}

#[async_trait]
impl QueueStore for LibSqlBackend {
    async fn enqueue(&self, conversation_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        let conn = self.db.connect().await?;
        QueueRepository::enqueue(&conn, conversation_id, priority).await
    }
    async fn enqueue_change(
        &self,
        conversation_id: &str,
        priority: i64,
        changed_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let conn = self.db.connect().await?;
        QueueRepository::enqueue_change(&conn, conversation_id, priority, changed_at).await
    }
    async fn claim(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.db.connect().await?;
        QueueRepository::claim(&conn, conversation_id).await
    }
    async fn claim_next(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.db.connect().await?;
        QueueRepository::claim_next(&conn, limit).await
    }
    async fn complete(&self, conversation_id: &str) -> Result<QueueStatus> {
        let conn = self.db.connect().await?;
        QueueRepository::complete(&conn, conversation_id).await
    }
    async fn fail(&self, conversation_id: &str, error: &str) -> Result<QueueStatus> {
        let conn = self.db.connect().await?;
        QueueRepository::fail(&conn, conversation_id, error).await
    }
    async fn cancel(&self, conversation_id: &str) -> Result<bool> {
        let conn = self.db.connect().await?;
        QueueRepository::cancel(&conn, conversation_id).await
    }
    async fn get_queue_entry(&self, conversation_id: &str) -> Result<Option<QueueEntry>> {
        let conn = self.db.connect().await?;
        QueueRepository::get(&conn, conversation_id).await
    }
    async fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.db.connect().await?;
        QueueRepository::stats(&conn).await
    }
    async fn reset_stale_processing(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let conn = self.db.connect().await?;
        QueueRepository::reset_stale_processing(&conn, started_before).await
    }
    async fn clear_completed(&self) -> Result<u64> {
        let conn = self.db.connect().await?;
        QueueRepository::clear_completed(&conn).await
    }
}

#[async_trait]
impl MetadataStore for LibSqlBackend {
    async fn get_poll_checkpoint(&self) -> Result<Option<PollCheckpoint>> {
        let conn = self.db.connect().await?;
        MetadataRepository::get_poll_checkpoint(&conn).await
    }
    async fn set_poll_checkpoint(&self, checkpoint: &PollCheckpoint) -> Result<()> {
        let conn = self.db.connect().await?;
        MetadataRepository::set_poll_checkpoint(&conn, checkpoint).await
    }
    async fn get_embedding_model(&self) -> Result<Option<String>> {
        let conn = self.db.connect().await?;
        MetadataRepository::get_embedding_model(&conn).await
    }
    async fn set_embedding_model(&self, model: &str) -> Result<()> {
        let conn = self.db.connect().await?;
        MetadataRepository::set_embedding_model(&conn, model).await
    }
}

#[async_trait]
impl DatabaseBackend for LibSqlBackend {
    async fn sync(&self) -> Result<()> {
        self.db.sync().await
    }
}
