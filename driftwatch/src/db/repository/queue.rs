use chrono::{DateTime, Utc};
use libsql::{params, Connection, TransactionBehavior};

use crate::error::{DriftError, Result};
use crate::models::{EnqueueOutcome, QueueEntry, QueueStats, QueueStatus};

use super::{format_ts, parse_ts, parse_ts_opt, ConversationRepository};

const ENTRY_COLUMNS: &str = "conversation_id, status, priority, queued_at, started_at, completed_at, error_message, rerun_requested";

pub struct QueueRepository;

impl QueueRepository {
    /// Enqueue a conversation, keeping a single entry per conversation.
    ///
    /// A pending entry keeps the higher of the two priorities. An entry that is
    /// already processing is flagged to run again once the current pass ends.
    pub async fn enqueue(
        conn: &Connection,
        conversation_id: &str,
        priority: i64,
    ) -> Result<EnqueueOutcome> {
        Self::enqueue_inner(conn, conversation_id, priority, None).await
    }

    /// Enqueue in response to a change observed at `changed_at`. Unlike
    /// [`Self::enqueue`], an entry cancelled at or after that time stays
    /// cancelled.
    pub async fn enqueue_change(
        conn: &Connection,
        conversation_id: &str,
        priority: i64,
        changed_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        Self::enqueue_inner(conn, conversation_id, priority, Some(changed_at)).await
    }

    async fn enqueue_inner(
        conn: &Connection,
        conversation_id: &str,
        priority: i64,
        changed_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        if !ConversationRepository::exists(&tx, conversation_id).await? {
            return Err(DriftError::NotFound(format!(
                "Conversation {conversation_id} not found"
            )));
        }

        let now = format_ts(&Utc::now());
        let existing = {
            let mut rows = tx
                .query(
                    "SELECT status, priority, completed_at FROM processing_queue WHERE conversation_id = ?1",
                    params![conversation_id],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Some((
                    row.get::<String>(0)?
                        .parse::<QueueStatus>()
                        .unwrap_or(QueueStatus::Failed),
                    row.get::<i64>(1)?,
                    parse_ts_opt(row.get(2)?),
                )),
                None => None,
            }
        };

        let outcome = match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO processing_queue (conversation_id, status, priority, queued_at)
                    VALUES (?1, 'pending', ?2, ?3)
                    "#,
                    params![conversation_id, priority, now],
                )
                .await?;
                EnqueueOutcome::Queued
            }
            Some((QueueStatus::Pending, current, _)) if priority > current => {
                tx.execute(
                    "UPDATE processing_queue SET priority = ?2 WHERE conversation_id = ?1",
                    params![conversation_id, priority],
                )
                .await?;
                EnqueueOutcome::Promoted
            }
            Some((QueueStatus::Pending, _, _)) => EnqueueOutcome::AlreadyQueued,
            Some((QueueStatus::Processing, current, _)) => {
                tx.execute(
                    r#"
                    UPDATE processing_queue SET rerun_requested = 1, priority = ?2
                    WHERE conversation_id = ?1
                    "#,
                    params![conversation_id, priority.max(current)],
                )
                .await?;
                EnqueueOutcome::Coalesced
            }
            Some((QueueStatus::Cancelled, _, Some(cancelled_at)))
                if changed_at.is_some_and(|changed| changed <= cancelled_at) =>
            {
                EnqueueOutcome::Suppressed
            }
            Some(_) => {
                tx.execute(
                    r#"
                    UPDATE processing_queue SET
                        status = 'pending',
                        priority = ?2,
                        queued_at = ?3,
                        started_at = NULL,
                        completed_at = NULL,
                        error_message = NULL,
                        rerun_requested = 0
                    WHERE conversation_id = ?1
                    "#,
                    params![conversation_id, priority, now],
                )
                .await?;
                EnqueueOutcome::Requeued
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Move one specific pending entry to processing. Returns false when the
    /// entry is missing or not pending.
    pub async fn claim(conn: &Connection, conversation_id: &str) -> Result<bool> {
        let rows_affected = conn
            .execute(
                r#"
                UPDATE processing_queue SET
                    status = 'processing',
                    started_at = ?2,
                    completed_at = NULL,
                    error_message = NULL,
                    rerun_requested = 0
                WHERE conversation_id = ?1 AND status = 'pending'
                "#,
                params![conversation_id, format_ts(&Utc::now())],
            )
            .await?;
        Ok(rows_affected == 1)
    }

    /// Claim up to `limit` pending entries, highest priority then oldest first.
    pub async fn claim_next(conn: &Connection, limit: usize) -> Result<Vec<QueueEntry>> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let ids = {
            let mut rows = tx
                .query(
                    r#"
                    SELECT conversation_id FROM processing_queue
                    WHERE status = 'pending'
                    ORDER BY priority DESC, queued_at ASC, conversation_id ASC
                    LIMIT ?1
                    "#,
                    params![limit as i64],
                )
                .await?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().await? {
                ids.push(row.get::<String>(0)?);
            }
            ids
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            if Self::claim(&tx, id).await? {
                if let Some(entry) = Self::get(&tx, id).await? {
                    claimed.push(entry);
                }
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    pub async fn complete(conn: &Connection, conversation_id: &str) -> Result<QueueStatus> {
        Self::finish(conn, conversation_id, QueueStatus::Completed, None).await
    }

    pub async fn fail(conn: &Connection, conversation_id: &str, error: &str) -> Result<QueueStatus> {
        Self::finish(conn, conversation_id, QueueStatus::Failed, Some(error)).await
    }

    /// Close a processing entry. A rerun request sends it back to pending.
    async fn finish(
        conn: &Connection,
        conversation_id: &str,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<QueueStatus> {
        let now = format_ts(&Utc::now());
        conn.execute(
            r#"
            UPDATE processing_queue SET
                status = CASE WHEN rerun_requested = 1 THEN 'pending' ELSE ?2 END,
                queued_at = CASE WHEN rerun_requested = 1 THEN ?3 ELSE queued_at END,
                completed_at = ?3,
                error_message = ?4,
                rerun_requested = 0
            WHERE conversation_id = ?1 AND status = 'processing'
            "#,
            params![
                conversation_id,
                status.to_string(),
                now,
                error.map(|e| e.to_string()),
            ],
        )
        .await?;

        Ok(Self::get(conn, conversation_id)
            .await?
            .map(|entry| entry.status)
            .unwrap_or(status))
    }

    /// Cancel a pending entry. Processing entries are never interrupted.
    pub async fn cancel(conn: &Connection, conversation_id: &str) -> Result<bool> {
        let rows_affected = conn
            .execute(
                r#"
                UPDATE processing_queue SET status = 'cancelled', completed_at = ?2
                WHERE conversation_id = ?1 AND status = 'pending'
                "#,
                params![conversation_id, format_ts(&Utc::now())],
            )
            .await?;
        Ok(rows_affected == 1)
    }

    pub async fn get(conn: &Connection, conversation_id: &str) -> Result<Option<QueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM processing_queue WHERE conversation_id = ?1");
        let mut rows = conn.query(&sql, params![conversation_id]).await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_entry(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn stats(conn: &Connection) -> Result<QueueStats> {
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM processing_queue GROUP BY status",
                (),
            )
            .await?;

        let mut stats = QueueStats::default();
        while let Some(row) = rows.next().await? {
            let count = row.get::<i64>(1)? as u64;
            match row.get::<String>(0)?.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => stats.pending = count,
                Ok(QueueStatus::Processing) => stats.processing = count,
                Ok(QueueStatus::Completed) => stats.completed = count,
                Ok(QueueStatus::Failed) => stats.failed = count,
                Ok(QueueStatus::Cancelled) => stats.cancelled = count,
                Err(e) => tracing::warn!(error = %e, "Skipping unknown queue status"),
            }
        }
        Ok(stats)
    }

    /// Return entries stuck in processing since before `started_before` to
    /// pending. Younger entries may belong to a live run and are left alone.
    pub async fn reset_stale_processing(
        conn: &Connection,
        started_before: DateTime<Utc>,
    ) -> Result<u64> {
        let rows_affected = conn
            .execute(
                r#"
                UPDATE processing_queue SET status = 'pending', started_at = NULL, rerun_requested = 0
                WHERE status = 'processing'
                  AND (started_at IS NULL OR started_at < ?1)
                "#,
                params![format_ts(&started_before)],
            )
            .await?;
        Ok(rows_affected)
    }

    pub async fn clear_completed(conn: &Connection) -> Result<u64> {
        let rows_affected = conn
            .execute("DELETE FROM processing_queue WHERE status = 'completed'", ())
            .await?;
        Ok(rows_affected)
    }

    fn row_to_entry(row: &libsql::Row) -> Result<QueueEntry> {
        Ok(QueueEntry {
            conversation_id: row.get(0)?,
            status: row
                .get::<String>(1)?
                .parse()
                .unwrap_or(QueueStatus::Failed),
            priority: row.get(2)?,
            queued_at: parse_ts(&row.get::<String>(3)?),
            started_at: parse_ts_opt(row.get(4)?),
            completed_at: parse_ts_opt(row.get(5)?),
            error_message: row.get(6)?,
            rerun_requested: row.get::<i64>(7)? != 0,
        })
    }
}
