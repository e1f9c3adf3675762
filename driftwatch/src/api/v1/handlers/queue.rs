//! v1 queue handlers.

use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::api::v1::response::{ApiResponse, ErrorCode};
use crate::api::AppState;
use crate::models::EnqueueOutcome;

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueQuery {
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub conversation_id: String,
    pub outcome: EnqueueOutcome,
}

/// `POST /api/v1/queue/{conversationId}`
pub async fn enqueue(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<EnqueueQuery>,
) -> ApiResponse<EnqueueResponse> {
    let priority = query
        .priority
        .unwrap_or(state.config.processing.ingest_priority);

    match state.divergence.enqueue(&conversation_id, priority).await {
        Ok(outcome) => ApiResponse::accepted(EnqueueResponse {
            conversation_id,
            outcome,
        }),
        Err(e) => e.into(),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub conversation_id: String,
    pub cancelled: bool,
}

/// `DELETE /api/v1/queue/{conversationId}`
///
/// Only pending entries can be cancelled.
pub async fn cancel(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResponse<CancelResponse> {
    match state.divergence.cancel(&conversation_id).await {
        Ok(true) => ApiResponse::success(CancelResponse {
            conversation_id,
            cancelled: true,
        }),
        Ok(false) => ApiResponse::error(
            ErrorCode::Conflict,
            format!("Conversation {conversation_id} has no pending queue entry"),
        ),
        Err(e) => e.into(),
    }
}
