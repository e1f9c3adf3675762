use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{Segment, SegmentAnchor};

use super::{decode_embedding, encode_embedding, format_ts, parse_ts};

pub struct SegmentRepository;

impl SegmentRepository {
    pub async fn create(conn: &Connection, segment: &Segment) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO segments (
                id, conversation_id, start_index, end_index, anchor_embedding,
                embedding_model, embedding_dim, topic_label, summary,
                parent_segment_id, divergence_score, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                segment.id.clone(),
                segment.conversation_id.clone(),
                segment.start_index as i64,
                segment.end_index as i64,
                encode_embedding(&segment.anchor_embedding),
                segment.embedding_model.clone(),
                segment.anchor_embedding.len() as i64,
                segment.topic_label.clone(),
                segment.summary.clone(),
                segment.parent_segment_id.clone(),
                segment.divergence_score,
                format_ts(&segment.created_at),
            ],
        )
        .await?;

        Ok(())
    }

    pub async fn delete_by_conversation(conn: &Connection, conversation_id: &str) -> Result<u64> {
        let rows_affected = conn
            .execute(
                "DELETE FROM segments WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await?;
        Ok(rows_affected)
    }

    pub async fn get_by_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Vec<Segment>> {
        let mut rows = conn
            .query(
                r#"
                SELECT id, conversation_id, start_index, end_index, anchor_embedding,
                       embedding_model, topic_label, summary, parent_segment_id,
                       divergence_score, created_at
                FROM segments
                WHERE conversation_id = ?1
                ORDER BY start_index ASC
                "#,
                params![conversation_id],
            )
            .await?;

        let mut segments = Vec::new();
        while let Some(row) = rows.next().await? {
            segments.push(Self::row_to_segment(&row)?);
        }
        Ok(segments)
    }

    /// Anchors comparable with the given model, excluding one conversation.
    pub async fn list_anchors(
        conn: &Connection,
        embedding_model: &str,
        embedding_dim: usize,
        exclude_conversation: Option<&str>,
    ) -> Result<Vec<SegmentAnchor>> {
        let mut rows = conn
            .query(
                r#"
                SELECT s.id, s.conversation_id, c.created_at, s.divergence_score, s.anchor_embedding
                FROM segments s
                JOIN conversations c ON c.id = s.conversation_id
                WHERE s.embedding_model = ?1
                  AND s.embedding_dim = ?2
                  AND s.conversation_id <> ?3
                "#,
                params![
                    embedding_model,
                    embedding_dim as i64,
                    exclude_conversation.unwrap_or("").to_string(),
                ],
            )
            .await?;

        let mut anchors = Vec::new();
        while let Some(row) = rows.next().await? {
            anchors.push(SegmentAnchor {
                segment_id: row.get(0)?,
                conversation_id: row.get(1)?,
                conversation_created_at: parse_ts(&row.get::<String>(2)?),
                divergence_score: row.get(3)?,
                embedding: decode_embedding(&row.get::<Vec<u8>>(4)?),
            });
        }
        Ok(anchors)
    }

    pub async fn count(conn: &Connection) -> Result<u64> {
        let mut rows = conn.query("SELECT COUNT(*) FROM segments", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    pub async fn count_stale(conn: &Connection, current_model: &str) -> Result<u64> {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM segments WHERE embedding_model <> ?1",
                params![current_model],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    /// Conversations whose segments were embedded by another model.
    pub async fn conversations_with_stale_model(
        conn: &Connection,
        current_model: &str,
    ) -> Result<Vec<String>> {
        let mut rows = conn
            .query(
                "SELECT DISTINCT conversation_id FROM segments WHERE embedding_model <> ?1 ORDER BY conversation_id",
                params![current_model],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    fn row_to_segment(row: &libsql::Row) -> Result<Segment> {
        Ok(Segment {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            start_index: row.get::<i64>(2)? as usize,
            end_index: row.get::<i64>(3)? as usize,
            anchor_embedding: decode_embedding(&row.get::<Vec<u8>>(4)?),
            embedding_model: row.get(5)?,
            topic_label: row.get(6)?,
            summary: row.get(7)?,
            parent_segment_id: row.get(8)?,
            divergence_score: row.get(9)?,
            created_at: parse_ts(&row.get::<String>(10)?),
        })
    }
}
