use libsql::Connection;

use crate::error::Result;

pub async fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Conversations written by the ingestion collaborator
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            title TEXT,
            source TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            conversation_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT,
            PRIMARY KEY (conversation_id, position),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        -- Segments produced by the ensemble segmenter
        CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            start_index INTEGER NOT NULL,
            end_index INTEGER NOT NULL,
            anchor_embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            embedding_dim INTEGER NOT NULL,
            topic_label TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            parent_segment_id TEXT,
            divergence_score REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            CHECK (end_index >= start_index),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_segments_conversation ON segments(conversation_id, start_index);
        CREATE INDEX IF NOT EXISTS idx_segments_model ON segments(embedding_model, embedding_dim);

        -- Directed links between segments
        CREATE TABLE IF NOT EXISTS segment_links (
            id TEXT PRIMARY KEY,
            source_segment_id TEXT NOT NULL,
            target_segment_id TEXT NOT NULL,
            link_type TEXT NOT NULL,
            similarity_score REAL NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            CHECK (source_segment_id <> target_segment_id),
            UNIQUE (source_segment_id, target_segment_id),
            FOREIGN KEY (source_segment_id) REFERENCES segments(id) ON DELETE CASCADE,
            FOREIGN KEY (target_segment_id) REFERENCES segments(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_segment_links_target ON segment_links(target_segment_id);

        -- One report per conversation, replaced wholesale on each run
        CREATE TABLE IF NOT EXISTS divergence_reports (
            conversation_id TEXT PRIMARY KEY,
            overall_score REAL NOT NULL,
            embedding_drift_score REAL,
            topic_entropy_score REAL,
            topic_transition_score REAL,
            llm_relevance_score REAL,
            metrics TEXT NOT NULL DEFAULT '{}',
            num_segments INTEGER NOT NULL,
            should_split INTEGER NOT NULL DEFAULT 0,
            suggested_split_points TEXT NOT NULL DEFAULT '[]',
            return_points TEXT NOT NULL DEFAULT '[]',
            interpretation TEXT NOT NULL DEFAULT '',
            embedding_model TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_divergence_reports_score ON divergence_reports(overall_score DESC);

        -- Durable processing queue, at most one row per conversation
        CREATE TABLE IF NOT EXISTS processing_queue (
            conversation_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            rerun_requested INTEGER NOT NULL DEFAULT 0,
            CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_processing_queue_claim
            ON processing_queue(status, priority DESC, queued_at ASC);

        CREATE TABLE IF NOT EXISTS driftwatch_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();

        init_schema(&conn).await.unwrap();
        init_schema(&conn).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            tables.push(row.get::<String>(0).unwrap());
        }

        assert_eq!(
            tables,
            vec![
                "conversations",
                "divergence_reports",
                "driftwatch_meta",
                "messages",
                "processing_queue",
                "segment_links",
                "segments",
            ]
        );
    }

    #[tokio::test]
    async fn test_self_link_is_rejected() {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();
        init_schema(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO segment_links (id, source_segment_id, target_segment_id, link_type, similarity_score, created_at)
                 VALUES ('l1', 's1', 's1', 'references', 0.9, '2024-01-01T00:00:00Z')",
                (),
            )
            .await;

        assert!(result.is_err(), "a segment must not link to itself");
    }
}
