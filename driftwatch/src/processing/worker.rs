use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::AnalyzeOptions;
use crate::config::ProcessingConfig;
use crate::db::DatabaseBackend;
use crate::error::{DriftError, Result};
use crate::models::EnqueueOutcome;

use super::pipeline::{DivergencePipeline, ProcessOutcome};

struct RunningTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

/// Polling scheduler plus a fixed worker pool.
///
/// The poller enqueues conversations updated since the stored checkpoint,
/// claims pending entries and hands their ids to the workers over a bounded
/// channel. Claiming is the only way into the channel, so a conversation is
/// never processed by two workers at once.
pub struct BackgroundProcessor {
    db: Arc<dyn DatabaseBackend>,
    pipeline: DivergencePipeline,
    config: ProcessingConfig,
    options: AnalyzeOptions,
    running: Mutex<Option<RunningTasks>>,
}

impl BackgroundProcessor {
    pub fn new(
        db: Arc<dyn DatabaseBackend>,
        pipeline: DivergencePipeline,
        config: ProcessingConfig,
        options: AnalyzeOptions,
    ) -> Self {
        Self {
            db,
            pipeline,
            config,
            options,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Enqueue conversations updated since the checkpoint and advance it.
    /// Entries cancelled after their last update stay cancelled. Returns how
    /// many were enqueued.
    pub async fn enqueue_updated(&self) -> Result<usize> {
        let mut checkpoint = self.db.get_poll_checkpoint().await?;
        let page_size = self.config.poll_page_size.max(1);
        let mut enqueued = 0;

        loop {
            let page = self
                .db
                .list_conversations_updated_since(checkpoint.as_ref(), page_size)
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };

            for seen in &page {
                match self
                    .db
                    .enqueue_change(&seen.conversation_id, self.config.watcher_priority, seen.updated_at)
                    .await
                {
                    Ok(EnqueueOutcome::Suppressed) => {
                        tracing::debug!(conversation_id = %seen.conversation_id, "Skipping cancelled conversation");
                    }
                    Ok(outcome) => {
                        tracing::trace!(conversation_id = %seen.conversation_id, ?outcome, "Enqueued");
                        enqueued += 1;
                    }
                    // Deleted between listing and enqueueing.
                    Err(DriftError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }

            self.db.set_poll_checkpoint(&last).await?;
            checkpoint = Some(last);

            if page.len() < page_size {
                break;
            }
        }

        Ok(enqueued)
    }

    /// One scheduling pass: enqueue updates, then claim up to `batch_size`
    /// pending entries. Returns the claimed conversation ids.
    pub async fn poll_once(&self, batch_size: usize) -> Result<Vec<String>> {
        let enqueued = self.enqueue_updated().await?;
        let claimed = self.db.claim_next(batch_size.max(1)).await?;

        if enqueued > 0 || !claimed.is_empty() {
            tracing::info!(enqueued, claimed = claimed.len(), "Background poll");
        }

        Ok(claimed.into_iter().map(|entry| entry.conversation_id).collect())
    }

    /// Start polling every `poll_interval_secs`, claiming at most
    /// `batch_size` entries per pass.
    pub async fn start(self: &Arc<Self>, poll_interval_secs: u64, batch_size: usize) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DriftError::Conflict(
                "Background processing is already running".to_string(),
            ));
        }

        let stale_before = chrono::Duration::from_std(Duration::from_secs(
            self.config.stale_processing_secs,
        ))
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recovered = self.db.reset_stale_processing(stale_before).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Reset stale processing entries to pending");
        }

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<String>(self.config.channel_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.config.worker_count + 1);

        for worker_id in 0..self.config.worker_count.max(1) {
            let processor = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let token = token.child_token();
            handles.push(tokio::spawn(async move {
                processor.worker_loop(worker_id, rx, token).await;
            }));
        }

        let processor = Arc::clone(self);
        let poll_token = token.child_token();
        let interval = Duration::from_secs(poll_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            processor.poll_loop(interval, batch_size, tx, poll_token).await;
        }));

        tracing::info!(
            poll_interval_secs,
            batch_size,
            workers = self.config.worker_count.max(1),
            "Background processing started"
        );

        *running = Some(RunningTasks { token, handles, rx });
        Ok(())
    }

    /// Stop polling and wait for every task. Conversations already being
    /// processed finish first; claimed ids no worker picked up go back to
    /// pending.
    pub async fn stop(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };

        tasks.token.cancel();
        for handle in tasks.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Background task panicked");
            }
        }

        let mut rx = tasks.rx.lock().await;
        while let Ok(conversation_id) = rx.try_recv() {
            self.release(&conversation_id).await;
        }

        tracing::info!("Background processing stopped");
    }

    /// Return a claimed but unprocessed entry to pending.
    async fn release(&self, conversation_id: &str) {
        let result = async {
            self.db.fail(conversation_id, "released on shutdown").await?;
            self.db.enqueue(conversation_id, self.config.watcher_priority).await
        }
        .await;

        if let Err(err) = result {
            tracing::error!(conversation_id, error = %err, "Failed to release claimed entry");
        }
    }

    async fn poll_loop(
        &self,
        interval: Duration,
        batch_size: usize,
        tx: mpsc::Sender<String>,
        token: CancellationToken,
    ) {
        loop {
            match self.poll_once(batch_size).await {
                Ok(ids) => {
                    let mut pending = ids.into_iter();
                    while let Some(id) = pending.next() {
                        let unsent = tokio::select! {
                            _ = token.cancelled() => Some(id),
                            sent = tx.send(id.clone()) => sent.err().map(|e| e.0),
                        };
                        if let Some(id) = unsent {
                            for id in std::iter::once(id).chain(pending) {
                                self.release(&id).await;
                            }
                            return;
                        }
                    }
                }
                Err(err) => tracing::error!(error = %err, "Background poll failed"),
            }

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Background poller shutting down...");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<String>>>,
        token: CancellationToken,
    ) {
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = token.cancelled() => None,
                    id = rx.recv() => id,
                }
            };

            let Some(conversation_id) = next else {
                tracing::debug!(worker_id, "Worker shutting down");
                return;
            };

            match self.pipeline.process_claimed(&conversation_id, &self.options).await {
                Ok(ProcessOutcome::Analyzed { report, links }) => tracing::debug!(
                    worker_id,
                    conversation_id = %conversation_id,
                    overall_score = report.overall_score,
                    links,
                    "Conversation processed"
                ),
                Ok(ProcessOutcome::Skipped) => {}
                // Already logged and recorded on the queue entry.
                Err(_) => {}
            }
        }
    }
}
