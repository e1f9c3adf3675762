use libsql::{params, Connection};

use crate::error::Result;
use crate::models::{DivergenceReport, ReportSummary};

use super::{format_ts, parse_ts, SegmentRepository};

pub struct ReportRepository;

/// Aggregate figures over all stored reports.
#[derive(Debug, Clone, Default)]
pub struct ReportAggregates {
    pub analyzed: u64,
    pub high_divergence: u64,
    pub should_split: u64,
    pub average_score: Option<f64>,
}

impl ReportRepository {
    /// Replace a conversation's segments and report in a single transaction.
    /// Deleting old segments cascades to their links.
    pub async fn save_analysis(conn: &Connection, report: &DivergenceReport) -> Result<()> {
        let tx = conn.transaction().await?;

        SegmentRepository::delete_by_conversation(&tx, &report.conversation_id).await?;
        for segment in &report.segments {
            SegmentRepository::create(&tx, segment).await?;
        }

        tx.execute(
            r#"
            INSERT INTO divergence_reports (
                conversation_id, overall_score, embedding_drift_score, topic_entropy_score,
                topic_transition_score, llm_relevance_score, metrics, num_segments,
                should_split, suggested_split_points, return_points, interpretation,
                embedding_model, computed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(conversation_id) DO UPDATE SET
                overall_score = excluded.overall_score,
                embedding_drift_score = excluded.embedding_drift_score,
                topic_entropy_score = excluded.topic_entropy_score,
                topic_transition_score = excluded.topic_transition_score,
                llm_relevance_score = excluded.llm_relevance_score,
                metrics = excluded.metrics,
                num_segments = excluded.num_segments,
                should_split = excluded.should_split,
                suggested_split_points = excluded.suggested_split_points,
                return_points = excluded.return_points,
                interpretation = excluded.interpretation,
                embedding_model = excluded.embedding_model,
                computed_at = excluded.computed_at
            "#,
            params![
                report.conversation_id.clone(),
                report.overall_score,
                report.embedding_drift_score,
                report.topic_entropy_score,
                report.topic_transition_score,
                report.llm_relevance_score,
                serde_json::to_string(&report.metrics)?,
                report.num_segments as i64,
                report.should_split as i64,
                serde_json::to_string(&report.suggested_split_points)?,
                serde_json::to_string(&report.return_points)?,
                report.interpretation.clone(),
                report.embedding_model.clone(),
                format_ts(&report.computed_at),
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Read the report and its segments from one snapshot, so a concurrent
    /// `save_analysis` can never pair one run's report with another's
    /// segments.
    pub async fn get_by_conversation(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Option<DivergenceReport>> {
        let tx = conn.transaction().await?;
        let report = Self::read_report(&tx, conversation_id).await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn read_report(
        conn: &Connection,
        conversation_id: &str,
    ) -> Result<Option<DivergenceReport>> {
        let mut rows = conn
            .query(
                r#"
                SELECT conversation_id, overall_score, embedding_drift_score, topic_entropy_score,
                       topic_transition_score, llm_relevance_score, metrics, num_segments,
                       should_split, suggested_split_points, return_points, interpretation,
                       embedding_model, computed_at
                FROM divergence_reports
                WHERE conversation_id = ?1
                "#,
                params![conversation_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let segments = SegmentRepository::get_by_conversation(conn, conversation_id).await?;

        Ok(Some(DivergenceReport {
            conversation_id: row.get(0)?,
            overall_score: row.get(1)?,
            embedding_drift_score: row.get(2)?,
            topic_entropy_score: row.get(3)?,
            topic_transition_score: row.get(4)?,
            llm_relevance_score: row.get(5)?,
            metrics: serde_json::from_str(&row.get::<String>(6)?).unwrap_or_default(),
            num_segments: row.get::<i64>(7)? as usize,
            should_split: row.get::<i64>(8)? != 0,
            suggested_split_points: serde_json::from_str(&row.get::<String>(9)?)
                .unwrap_or_default(),
            return_points: serde_json::from_str(&row.get::<String>(10)?).unwrap_or_default(),
            interpretation: row.get(11)?,
            embedding_model: row.get(12)?,
            computed_at: parse_ts(&row.get::<String>(13)?),
            segments,
        }))
    }

    pub async fn exists(conn: &Connection, conversation_id: &str) -> Result<bool> {
        let mut rows = conn
            .query(
                "SELECT 1 FROM divergence_reports WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn list_high_divergence(
        conn: &Connection,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ReportSummary>> {
        let mut rows = conn
            .query(
                r#"
                SELECT conversation_id, overall_score, num_segments, should_split,
                       interpretation, computed_at
                FROM divergence_reports
                WHERE overall_score >= ?1
                ORDER BY overall_score DESC, conversation_id ASC
                LIMIT ?2
                "#,
                params![threshold, limit as i64],
            )
            .await?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            summaries.push(ReportSummary {
                conversation_id: row.get(0)?,
                overall_score: row.get(1)?,
                num_segments: row.get::<i64>(2)? as usize,
                should_split: row.get::<i64>(3)? != 0,
                interpretation: row.get(4)?,
                computed_at: parse_ts(&row.get::<String>(5)?),
            });
        }
        Ok(summaries)
    }

    pub async fn aggregates(conn: &Connection, high_threshold: f64) -> Result<ReportAggregates> {
        let mut rows = conn
            .query(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN overall_score >= ?1 THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(should_split), 0),
                       AVG(overall_score)
                FROM divergence_reports
                "#,
                params![high_threshold],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(ReportAggregates {
                analyzed: row.get::<i64>(0)? as u64,
                high_divergence: row.get::<i64>(1)? as u64,
                should_split: row.get::<i64>(2)? as u64,
                average_score: row.get::<Option<f64>>(3)?,
            }),
            None => Ok(ReportAggregates::default()),
        }
    }
}
