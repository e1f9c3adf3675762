use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalyzeOptions, EnsembleSegmenter};
use crate::config::Config;
use crate::db::DatabaseBackend;
use crate::embeddings::Embedder;
use crate::error::{DriftError, Result};
use crate::llm::LlmProvider;
use crate::models::{
    BackfillStats, Conversation, DivergenceReport, DivergenceStats, EnqueueOutcome,
    RelatedConversation, ReportSummary, Segment,
};
use crate::processing::{BackgroundProcessor, DivergencePipeline, IngestionHooks, ProcessOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeOptions {
    pub use_llm: bool,
    /// Falls back to the LLM configuration when unset.
    pub generate_summaries: Option<bool>,
    pub persist: bool,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            use_llm: true,
            generate_summaries: None,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackfillOptions {
    pub batch_size: usize,
    #[serde(alias = "max")]
    pub max_conversations: Option<usize>,
    pub skip_existing: bool,
    /// Reanalyze conversations that already have a report.
    pub force: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_conversations: None,
            skip_existing: true,
            force: false,
        }
    }
}

/// Entry point for every divergence operation: on-demand compute, report
/// queries, backfill and the background processor.
#[derive(Clone)]
pub struct DivergenceService {
    db: Arc<dyn DatabaseBackend>,
    pipeline: DivergencePipeline,
    hooks: IngestionHooks,
    background: Arc<BackgroundProcessor>,
    llm: Arc<LlmProvider>,
    high_threshold: f64,
    compute_priority: i64,
    backfill_priority: i64,
}

impl DivergenceService {
    pub fn new(
        config: &Config,
        db: Arc<dyn DatabaseBackend>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<LlmProvider>,
    ) -> Self {
        let segmenter = EnsembleSegmenter::new(config.analysis.clone(), embedder, Arc::clone(&llm));
        let pipeline = DivergencePipeline::new(Arc::clone(&db), segmenter);
        let background_options = AnalyzeOptions {
            use_llm: true,
            generate_summaries: llm.generate_summaries(),
        };
        let background = Arc::new(BackgroundProcessor::new(
            Arc::clone(&db),
            pipeline.clone(),
            config.processing.clone(),
            background_options,
        ));

        Self {
            hooks: IngestionHooks::new(Arc::clone(&db), &config.processing),
            high_threshold: config.analysis.ensemble.split_threshold,
            compute_priority: config.processing.ingest_priority,
            backfill_priority: config.processing.watcher_priority,
            db,
            pipeline,
            background,
            llm,
        }
    }

    pub fn hooks(&self) -> &IngestionHooks {
        &self.hooks
    }

    pub fn embedding_model(&self) -> &str {
        self.pipeline.segmenter().embedding_model()
    }

    fn analyze_options(&self, options: &ComputeOptions) -> AnalyzeOptions {
        AnalyzeOptions {
            use_llm: options.use_llm,
            generate_summaries: options
                .generate_summaries
                .unwrap_or_else(|| self.llm.generate_summaries()),
        }
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.db
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| DriftError::NotFound(format!("Conversation {conversation_id} not found")))
    }

    /// Store a conversation from the ingestion collaborator and fire the
    /// ingestion hook.
    pub async fn ingest(&self, conversation: &Conversation) -> Result<EnqueueOutcome> {
        self.db.upsert_conversation(conversation).await?;
        self.hooks.on_conversation_ingested(&conversation.id).await
    }

    /// Analyze one conversation now.
    ///
    /// With `persist` the run goes through the queue like any background
    /// job, so it fails with `Conflict` while the conversation is already
    /// being processed.
    pub async fn compute(
        &self,
        conversation_id: &str,
        options: &ComputeOptions,
    ) -> Result<DivergenceReport> {
        let conversation = self.conversation(conversation_id).await?;
        let analyze_options = self.analyze_options(options);

        if !options.persist || conversation.messages.is_empty() {
            return self.pipeline.analyze(&conversation, &analyze_options).await;
        }

        if self.db.enqueue(conversation_id, self.compute_priority).await? == EnqueueOutcome::Coalesced
            || !self.db.claim(conversation_id).await?
        {
            return Err(DriftError::Conflict(format!(
                "Conversation {conversation_id} is already being processed"
            )));
        }

        match self.pipeline.process_claimed(conversation_id, &analyze_options).await? {
            ProcessOutcome::Analyzed { report, .. } => Ok(*report),
            ProcessOutcome::Skipped => self.pipeline.analyze(&conversation, &analyze_options).await,
        }
    }

    pub async fn get_report(&self, conversation_id: &str) -> Result<DivergenceReport> {
        self.db
            .get_report(conversation_id)
            .await?
            .ok_or_else(|| {
                DriftError::NotFound(format!("No divergence report for {conversation_id}"))
            })
    }

    pub async fn list_high_divergence(
        &self,
        threshold: Option<f64>,
        limit: usize,
    ) -> Result<Vec<ReportSummary>> {
        let threshold = threshold.unwrap_or(self.high_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DriftError::Validation(
                "threshold must be between 0 and 1".to_string(),
            ));
        }
        self.db.list_high_divergence(threshold, limit).await
    }

    pub async fn segments_for(&self, conversation_id: &str) -> Result<Vec<Segment>> {
        let segments = self.db.get_segments(conversation_id).await?;
        if segments.is_empty() && self.db.get_conversation(conversation_id).await?.is_none() {
            return Err(DriftError::NotFound(format!(
                "Conversation {conversation_id} not found"
            )));
        }
        Ok(segments)
    }

    /// Other conversations ranked by best segment similarity, excluding
    /// `conversation_id` itself.
    pub async fn related_conversations(
        &self,
        conversation_id: &str,
        min_similarity: f64,
        limit: usize,
    ) -> Result<Vec<RelatedConversation>> {
        let segments = self.segments_for(conversation_id).await?;
        let Some(dim) = segments
            .iter()
            .map(|s| s.anchor_embedding.len())
            .find(|&len| len > 0)
        else {
            return Ok(Vec::new());
        };

        let model = segments
            .first()
            .map(|s| s.embedding_model.clone())
            .unwrap_or_else(|| self.embedding_model().to_string());
        let anchors = self
            .db
            .list_segment_anchors(&model, dim, Some(conversation_id))
            .await?;

        Ok(self.pipeline.linker().related_conversations(
            conversation_id,
            &segments,
            &anchors,
            min_similarity,
            limit,
        ))
    }

    /// Analyze every conversation lacking a report (all of them with
    /// `force`), in batches. Safe to rerun: finished conversations are
    /// skipped.
    pub async fn backfill_all(&self, options: &BackfillOptions) -> Result<BackfillStats> {
        let batch_size = options.batch_size.max(1);
        let only_missing = options.skip_existing && !options.force;
        let analyze_options = self.analyze_options(&ComputeOptions::default());
        let limit = options.max_conversations.unwrap_or(usize::MAX);

        let mut stats = BackfillStats::default();
        let mut after: Option<String> = None;
        let mut attempted = 0usize;

        tracing::info!(batch_size, only_missing, "Backfill started");

        'pages: loop {
            let page = self
                .db
                .list_conversation_ids_page(after.as_deref(), batch_size, only_missing)
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };

            for conversation_id in &page {
                if attempted >= limit {
                    break 'pages;
                }
                attempted += 1;

                match self.backfill_one(conversation_id, &analyze_options).await {
                    Ok(true) => stats.processed += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(err) => {
                        tracing::warn!(conversation_id = %conversation_id, error = %err, "Backfill item failed");
                        stats.failed += 1;
                    }
                }
            }

            tracing::info!(
                processed = stats.processed,
                failed = stats.failed,
                skipped = stats.skipped,
                "Backfill batch complete"
            );

            if page.len() < batch_size {
                break;
            }
            after = Some(last);
        }

        tracing::info!(
            processed = stats.processed,
            failed = stats.failed,
            skipped = stats.skipped,
            "Backfill finished"
        );
        Ok(stats)
    }

    /// Returns `Ok(false)` when the conversation was skipped.
    async fn backfill_one(&self, conversation_id: &str, options: &AnalyzeOptions) -> Result<bool> {
        match self.db.enqueue(conversation_id, self.backfill_priority).await {
            Ok(EnqueueOutcome::Coalesced) => return Ok(false),
            Ok(_) => {}
            Err(DriftError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        }

        if !self.db.claim(conversation_id).await? {
            return Ok(false);
        }

        match self.pipeline.process_claimed(conversation_id, options).await? {
            ProcessOutcome::Analyzed { .. } => Ok(true),
            ProcessOutcome::Skipped => Ok(false),
        }
    }

    pub async fn stats(&self) -> Result<DivergenceStats> {
        let aggregates = self.db.report_aggregates(self.high_threshold).await?;

        Ok(DivergenceStats {
            total_conversations: self.db.count_conversations().await?,
            analyzed_conversations: aggregates.analyzed,
            high_divergence: aggregates.high_divergence,
            should_split: aggregates.should_split,
            average_score: aggregates.average_score,
            total_segments: self.db.count_segments().await?,
            total_links: self.db.count_links().await?,
            stale_segments: self.db.count_stale_segments(self.embedding_model()).await?,
            queue: self.db.queue_stats().await?,
        })
    }

    /// Compare the stored embedding model with the current one and queue
    /// every conversation analyzed with a different model. Returns how many
    /// were queued.
    pub async fn check_embedding_model(&self) -> Result<usize> {
        let current = self.embedding_model().to_string();
        let stored = self.db.get_embedding_model().await?;

        if stored.as_deref() == Some(current.as_str()) {
            return Ok(0);
        }

        let stale = self.db.conversations_with_stale_model(&current).await?;
        for conversation_id in &stale {
            self.db.enqueue(conversation_id, self.backfill_priority).await?;
        }

        if !stale.is_empty() {
            tracing::warn!(
                previous = stored.as_deref().unwrap_or("none"),
                current = %current,
                queued = stale.len(),
                "Embedding model changed, queued conversations for recompute"
            );
        }

        self.db.set_embedding_model(&current).await?;
        Ok(stale.len())
    }

    pub async fn enqueue(&self, conversation_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        self.db.enqueue(conversation_id, priority).await
    }

    pub async fn cancel(&self, conversation_id: &str) -> Result<bool> {
        self.db.cancel(conversation_id).await
    }

    pub async fn start_background_processing(
        &self,
        poll_interval_secs: u64,
        batch_size: usize,
    ) -> Result<()> {
        self.background.start(poll_interval_secs, batch_size).await
    }

    pub async fn stop_background_processing(&self) {
        self.background.stop().await;
    }

    pub async fn is_background_running(&self) -> bool {
        self.background.is_running().await
    }
}
