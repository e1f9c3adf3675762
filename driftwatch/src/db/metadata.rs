use crate::error::Result;
use crate::models::PollCheckpoint;
use chrono::{DateTime, Utc};
use libsql::Connection;

use super::repository::format_ts;

const POLL_CHECKPOINT_KEY: &str = "poll_checkpoint";
const POLL_CHECKPOINT_ID_KEY: &str = "poll_checkpoint_id";
const EMBEDDING_MODEL_KEY: &str = "embedding_model";

pub struct MetadataRepository;

impl MetadataRepository {
    pub async fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let mut rows = conn
            .query("SELECT value FROM driftwatch_meta WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get::<String>(0)?))
        } else {
            Ok(None)
        }
    }

    pub async fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
        let now = format_ts(&Utc::now());
        conn.execute(
            "INSERT INTO driftwatch_meta (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            [key, value, &now],
        )
        .await?;
        Ok(())
    }

    /// A checkpoint written before ids were tracked resumes from the start
    /// of its timestamp, which can only re-enqueue, never skip.
    pub async fn get_poll_checkpoint(conn: &Connection) -> Result<Option<PollCheckpoint>> {
        let Some(updated_at) = Self::get(conn, POLL_CHECKPOINT_KEY)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
        else {
            return Ok(None);
        };

        Ok(Some(PollCheckpoint {
            updated_at,
            conversation_id: Self::get(conn, POLL_CHECKPOINT_ID_KEY)
                .await?
                .unwrap_or_default(),
        }))
    }

    pub async fn set_poll_checkpoint(conn: &Connection, checkpoint: &PollCheckpoint) -> Result<()> {
        let tx = conn.transaction().await?;
        Self::set(&tx, POLL_CHECKPOINT_KEY, &format_ts(&checkpoint.updated_at)).await?;
        Self::set(&tx, POLL_CHECKPOINT_ID_KEY, &checkpoint.conversation_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_embedding_model(conn: &Connection) -> Result<Option<String>> {
        Self::get(conn, EMBEDDING_MODEL_KEY).await
    }

    pub async fn set_embedding_model(conn: &Connection, model: &str) -> Result<()> {
        Self::set(conn, EMBEDDING_MODEL_KEY, model).await
    }
}
