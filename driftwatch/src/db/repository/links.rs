use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{LinkType, SegmentLink};

use super::{format_ts, parse_ts};

pub struct LinkRepository;

impl LinkRepository {
    pub async fn create(conn: &Connection, link: &SegmentLink) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO segment_links (
                id, source_segment_id, target_segment_id, link_type,
                similarity_score, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(source_segment_id, target_segment_id) DO UPDATE SET
                link_type = excluded.link_type,
                similarity_score = excluded.similarity_score,
                metadata = excluded.metadata
            "#,
            params![
                link.id.clone(),
                link.source_segment_id.clone(),
                link.target_segment_id.clone(),
                link.link_type.to_string(),
                link.similarity_score,
                serde_json::to_string(&link.metadata)?,
                format_ts(&link.created_at),
            ],
        )
        .await?;

        Ok(())
    }

    /// Replace every outgoing link of a conversation's segments in one transaction.
    pub async fn replace_for_conversation(
        conn: &Connection,
        conversation_id: &str,
        links: &[SegmentLink],
    ) -> Result<()> {
        let tx = conn.transaction().await?;

        tx.execute(
            r#"
            DELETE FROM segment_links
            WHERE source_segment_id IN (SELECT id FROM segments WHERE conversation_id = ?1)
            "#,
            params![conversation_id],
        )
        .await?;

        for link in links {
            Self::create(&tx, link).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Vec<SegmentLink>> {
        let mut rows = conn
            .query(
                r#"
                SELECT l.id, l.source_segment_id, l.target_segment_id, l.link_type,
                       l.similarity_score, l.metadata, l.created_at
                FROM segment_links l
                JOIN segments s ON s.id = l.source_segment_id
                WHERE s.conversation_id = ?1
                ORDER BY l.similarity_score DESC, l.id ASC
                "#,
                params![conversation_id],
            )
            .await?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await? {
            links.push(Self::row_to_link(&row)?);
        }
        Ok(links)
    }

    pub async fn count(conn: &Connection) -> Result<u64> {
        let mut rows = conn.query("SELECT COUNT(*) FROM segment_links", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as u64),
            None => Ok(0),
        }
    }

    fn row_to_link(row: &libsql::Row) -> Result<SegmentLink> {
        Ok(SegmentLink {
            id: row.get(0)?,
            source_segment_id: row.get(1)?,
            target_segment_id: row.get(2)?,
            link_type: row
                .get::<String>(3)?
                .parse()
                .unwrap_or(LinkType::References),
            similarity_score: row.get(4)?,
            metadata: serde_json::from_str(&row.get::<String>(5)?).unwrap_or_default(),
            created_at: parse_ts(&row.get::<String>(6)?),
        })
    }
}
