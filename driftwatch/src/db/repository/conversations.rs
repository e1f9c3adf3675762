use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{Conversation, Message, PollCheckpoint, Role};

use super::{format_ts, parse_ts, parse_ts_opt};

pub struct ConversationRepository;

impl ConversationRepository {
    /// Insert or replace a conversation and its full message list.
    pub async fn upsert(conn: &Connection, conversation: &Conversation) -> Result<()> {
        let tx = conn.transaction().await?;

        tx.execute(
            r#"
            INSERT INTO conversations (id, title, source, message_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source = excluded.source,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at
            "#,
            params![
                conversation.id.clone(),
                conversation.title.clone(),
                conversation.source.clone(),
                conversation.messages.len() as i64,
                format_ts(&conversation.created_at),
                format_ts(&conversation.updated_at),
            ],
        )
        .await?;

        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation.id.clone()],
        )
        .await?;

        for (position, message) in conversation.messages.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO messages (conversation_id, position, role, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    conversation.id.clone(),
                    position as i64,
                    message.role.to_string(),
                    message.content.clone(),
                    message.created_at.as_ref().map(format_ts),
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
        let mut rows = conn
            .query(
                "SELECT id, title, source, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let mut conversation = Conversation {
            id: row.get(0)?,
            title: row.get(1)?,
            source: row.get(2)?,
            messages: Vec::new(),
            created_at: parse_ts(&row.get::<String>(3)?),
            updated_at: parse_ts(&row.get::<String>(4)?),
        };

        let mut rows = conn
            .query(
                "SELECT role, content, created_at FROM messages WHERE conversation_id = ?1 ORDER BY position ASC",
                params![id],
            )
            .await?;

        while let Some(row) = rows.next().await? {
            conversation.messages.push(Message {
                role: row.get::<String>(0)?.parse().unwrap_or(Role::User),
                content: row.get(1)?,
                created_at: parse_ts_opt(row.get(2)?),
            });
        }

        Ok(Some(conversation))
    }

    pub async fn exists(conn: &Connection, id: &str) -> Result<bool> {
        let mut rows = conn
            .query("SELECT 1 FROM conversations WHERE id = ?1", params![id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let rows_affected = conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])
            .await?;
        Ok(rows_affected > 0)
    }

    /// Conversations after `since` in `(updated_at, id)` order, oldest first.
    pub async fn list_updated_since(
        conn: &Connection,
        since: Option<&PollCheckpoint>,
        limit: usize,
    ) -> Result<Vec<PollCheckpoint>> {
        let (since_ts, since_id) = since
            .map(|c| (format_ts(&c.updated_at), c.conversation_id.clone()))
            .unwrap_or_default();

        let mut rows = conn
            .query(
                r#"
                SELECT id, updated_at FROM conversations
                WHERE updated_at > ?1 OR (updated_at = ?1 AND id > ?2)
                ORDER BY updated_at ASC, id ASC
                LIMIT ?3
                "#,
                params![since_ts, since_id, limit as i64],
            )
            .await?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            result.push(PollCheckpoint {
                conversation_id: row.get::<String>(0)?,
                updated_at: parse_ts(&row.get::<String>(1)?),
            });
        }
        Ok(result)
    }

    /// Keyset page of conversation ids after `after`, optionally limited to
    /// those without a divergence report.
    pub async fn list_ids_page(
        conn: &Connection,
        after: Option<&str>,
        limit: usize,
        only_missing_report: bool,
    ) -> Result<Vec<String>> {
        let sql = if only_missing_report {
            r#"
            SELECT c.id FROM conversations c
            LEFT JOIN divergence_reports r ON r.conversation_id = c.id
            WHERE c.id > ?1 AND r.conversation_id IS NULL
            ORDER BY c.id ASC
            LIMIT ?2
            "#
        } else {
            "SELECT id FROM conversations WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        };

        let mut rows = conn
            .query(sql, params![after.unwrap_or("").to_string(), limit as i64])
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn count(conn: &Connection) -> Result<u64> {
        let mut rows = conn.query("SELECT COUNT(*) FROM conversations", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }
}
