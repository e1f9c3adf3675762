//! # V1 API Response Envelope
//!
//! Every v1 endpoint answers with an [`ApiResponse<T>`]:
//!
//! ```json
//! {
//!   "data": { ... },                               // success only
//!   "meta": { "total": 42 },                       // optional
//!   "error": { "code": "not_found", "message": "..." }  // failure only
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::DriftError;

/// Machine-readable error code, serialized as snake_case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// HTTP 400.
    InvalidRequest,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 404.
    NotFound,
    /// HTTP 409. Returned when a conversation is already being processed.
    Conflict,
    /// HTTP 429.
    RateLimited,
    /// HTTP 500. Internal details are never sent to the client.
    InternalError,
    /// HTTP 503. The embedding model or LLM could not be reached.
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::RateLimited => "rate_limited",
            Self::InternalError => "internal_error",
            Self::ServiceUnavailable => "service_unavailable",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,

    /// Not serialized.
    #[serde(skip)]
    status: StatusCode,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            meta: None,
            error: None,
            status: StatusCode::OK,
        }
    }

    pub fn success_with_meta(data: T, meta: ResponseMeta) -> Self {
        Self {
            data: Some(data),
            meta: Some(meta),
            error: None,
            status: StatusCode::OK,
        }
    }

    /// HTTP 202, used when work was queued rather than performed.
    pub fn accepted(data: T) -> Self {
        Self {
            data: Some(data),
            meta: None,
            error: None,
            status: StatusCode::ACCEPTED,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let status = code.status();
        Self {
            data: None,
            meta: None,
            error: Some(ApiError {
                code,
                message: message.into(),
            }),
            status,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = self.status;
        match serde_json::to_value(&self) {
            Ok(body) => (status, Json(body)).into_response(),
            Err(_) => {
                let body = serde_json::json!({
                    "error": {
                        "code": "internal_error",
                        "message": "An internal error occurred"
                    }
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

fn rate_limit_message(retry_after: Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!("Rate limit exceeded, retry after {secs} seconds"),
        None => "Rate limit exceeded".to_string(),
    }
}

impl<T: Serialize> From<DriftError> for ApiResponse<T> {
    /// Internal errors are logged and replaced with a generic message.
    fn from(err: DriftError) -> Self {
        match err {
            DriftError::NotFound(ref msg) => ApiResponse::error(ErrorCode::NotFound, msg.clone()),

            DriftError::Validation(ref msg) => {
                ApiResponse::error(ErrorCode::InvalidRequest, msg.clone())
            }

            DriftError::Conflict(ref msg) => ApiResponse::error(ErrorCode::Conflict, msg.clone()),

            DriftError::Json(ref e) => {
                ApiResponse::error(ErrorCode::InvalidRequest, format!("Invalid JSON: {e}"))
            }

            DriftError::ApiRateLimit { retry_after } | DriftError::LlmRateLimit { retry_after } => {
                ApiResponse::error(ErrorCode::RateLimited, rate_limit_message(retry_after))
            }

            DriftError::ModelUnavailable(ref msg) | DriftError::LlmUnavailable(ref msg) => {
                ApiResponse::error(ErrorCode::ServiceUnavailable, msg.clone())
            }

            ref internal @ (DriftError::Database(_)
            | DriftError::Processing(_)
            | DriftError::Embedding(_)
            | DriftError::Http(_)
            | DriftError::Io(_)
            | DriftError::Llm(_)
            | DriftError::Internal(_)) => {
                tracing::error!(error = %internal, "Internal error mapped to v1 response");
                ApiResponse::error(ErrorCode::InternalError, "An internal error occurred")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_serializes_without_error() {
        let resp = ApiResponse::success("hello");
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["data"], "hello");
        assert!(json.get("error").is_none());
        assert!(json.get("meta").is_none());
    }

    #[test]
    fn error_response_serializes_without_data() {
        let resp = ApiResponse::<()>::error(ErrorCode::NotFound, "gone");
        let json = serde_json::to_value(&resp).expect("serialize");
        assert!(json.get("data").is_none());
        assert_eq!(json["error"]["code"], "not_found");
        assert_eq!(json["error"]["message"], "gone");
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp: ApiResponse<()> = DriftError::Conflict("busy".into()).into();
        assert_eq!(resp.status, StatusCode::CONFLICT);
        assert_eq!(resp.error.as_ref().map(|e| e.message.as_str()), Some("busy"));
    }

    #[test]
    fn unavailable_model_maps_to_503() {
        let resp: ApiResponse<()> = DriftError::ModelUnavailable("no onnx".into()).into();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let resp: ApiResponse<()> = DriftError::Internal("secret stack".into()).into();
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["error"]["code"], "internal_error");
        assert_eq!(json["error"]["message"], "An internal error occurred");
    }

    #[test]
    fn error_code_display_matches_serde() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::RateLimited,
            ErrorCode::ServiceUnavailable,
        ] {
            let json = serde_json::to_value(&code).expect("serialize");
            assert_eq!(json, code.to_string());
        }
    }
}
