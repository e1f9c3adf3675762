use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API rate limit exceeded, retry after {retry_after:?} seconds")]
    ApiRateLimit { retry_after: Option<u64> },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM rate limit exceeded, retry after {retry_after:?} seconds")]
    LlmRateLimit { retry_after: Option<u64> },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DriftError {
    /// Errors after which further calls to the same LLM endpoint are pointless.
    pub fn is_fatal_llm(&self) -> bool {
        match self {
            DriftError::LlmUnavailable(_) => true,
            DriftError::Llm(msg) => msg.starts_with("LLM authentication failed"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriftError>;
