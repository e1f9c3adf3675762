//! v1 conversation handlers: ingestion and per-conversation divergence.

use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::api::v1::response::{ApiResponse, ErrorCode, ResponseMeta};
use crate::api::AppState;
use crate::models::{
    DivergenceReport, EnqueueOutcome, IngestConversationRequest, RelatedConversation, Segment,
};
use crate::services::ComputeOptions;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub conversation_id: String,
    pub message_count: usize,
    pub queue: EnqueueOutcome,
}

/// `POST /api/v1/conversations:ingest`
///
/// Stores the conversation and queues it for analysis.
pub async fn ingest_conversation(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<IngestConversationRequest>,
) -> ApiResponse<IngestResponse> {
    if let Err(e) = req.validate() {
        return ApiResponse::error(ErrorCode::InvalidRequest, e.to_string());
    }
    if req.id.trim().is_empty() {
        return ApiResponse::error(ErrorCode::InvalidRequest, "Conversation id cannot be empty");
    }

    let conversation = req.into_conversation();
    match state.divergence.ingest(&conversation).await {
        Ok(queue) => ApiResponse::accepted(IngestResponse {
            conversation_id: conversation.id,
            message_count: conversation.messages.len(),
            queue,
        }),
        Err(e) => e.into(),
    }
}

/// `GET /api/v1/conversations/{conversationId}/divergence`
pub async fn get_divergence(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResponse<DivergenceReport> {
    match state.divergence.get_report(&conversation_id).await {
        Ok(report) => ApiResponse::success(report),
        Err(e) => e.into(),
    }
}

/// `POST /api/v1/conversations/{conversationId}/divergence:compute`
///
/// Options come from the query string, e.g. `?useLlm=false&persist=false`.
pub async fn compute_divergence(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(options): Query<ComputeOptions>,
) -> ApiResponse<DivergenceReport> {
    match state.divergence.compute(&conversation_id, &options).await {
        Ok(report) => ApiResponse::success(report),
        Err(e) => e.into(),
    }
}

/// `GET /api/v1/conversations/{conversationId}/segments`
pub async fn list_segments(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResponse<Vec<Segment>> {
    match state.divergence.segments_for(&conversation_id).await {
        Ok(segments) => {
            let total = segments.len() as u64;
            ApiResponse::success_with_meta(segments, ResponseMeta { total: Some(total) })
        }
        Err(e) => e.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedQuery {
    pub min_similarity: Option<f64>,
    #[serde(default = "default_related_limit")]
    pub limit: usize,
}

fn default_related_limit() -> usize {
    10
}

/// `GET /api/v1/conversations/{conversationId}/related`
pub async fn related_conversations(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<RelatedQuery>,
) -> ApiResponse<Vec<RelatedConversation>> {
    let min_similarity = query
        .min_similarity
        .unwrap_or(state.config.analysis.linker.similarity_floor);
    if !(-1.0..=1.0).contains(&min_similarity) {
        return ApiResponse::error(
            ErrorCode::InvalidRequest,
            "minSimilarity must be between -1 and 1",
        );
    }

    match state
        .divergence
        .related_conversations(&conversation_id, min_similarity, query.limit.clamp(1, 100))
        .await
    {
        Ok(related) => ApiResponse::success(related),
        Err(e) => e.into(),
    }
}
