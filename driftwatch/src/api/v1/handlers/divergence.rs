//! v1 cross-conversation divergence handlers.

use axum::extract::{Query, State};
use serde::Deserialize;

use crate::api::v1::response::{ApiResponse, ResponseMeta};
use crate::api::AppState;
use crate::models::{BackfillStats, DivergenceStats, ReportSummary};
use crate::services::BackfillOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct HighDivergenceQuery {
    pub threshold: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// `GET /api/v1/divergence/high`
pub async fn list_high_divergence(
    State(state): State<AppState>,
    Query(query): Query<HighDivergenceQuery>,
) -> ApiResponse<Vec<ReportSummary>> {
    match state
        .divergence
        .list_high_divergence(query.threshold, query.limit.clamp(1, 100))
        .await
    {
        Ok(reports) => {
            let total = reports.len() as u64;
            ApiResponse::success_with_meta(reports, ResponseMeta { total: Some(total) })
        }
        Err(e) => e.into(),
    }
}

/// `GET /api/v1/divergence/stats`
pub async fn divergence_stats(State(state): State<AppState>) -> ApiResponse<DivergenceStats> {
    match state.divergence.stats().await {
        Ok(stats) => ApiResponse::success(stats),
        Err(e) => e.into(),
    }
}

/// `POST /api/v1/backfill`
///
/// Runs to completion before answering; `?maxConversations=` (or `?max=`)
/// bounds the run.
pub async fn run_backfill(
    State(state): State<AppState>,
    Query(options): Query<BackfillOptions>,
) -> ApiResponse<BackfillStats> {
    match state.divergence.backfill_all(&options).await {
        Ok(stats) => ApiResponse::success(stats),
        Err(e) => e.into(),
    }
}
