use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{parse_provider_model, EmbeddingsConfig};
use crate::error::{DriftError, Result};

/// Longest wait honoured from a `Retry-After` header.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10);

fn default_base_url(provider: &str) -> &'static str {
    match provider.to_lowercase().as_str() {
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "lmstudio" => "http://localhost:1234/v1",
        _ => "https://api.openai.com/v1",
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// How one failed request should be handled.
enum Attempt {
    Retry(DriftError, Option<Duration>),
    Abort(DriftError),
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
///
/// Messages are sent in batches of `batch_size`. An endpoint that cannot be
/// reached or that rejects the credentials is reported as
/// [`DriftError::ModelUnavailable`], which fails the conversation's queue
/// entry as retryable.
#[derive(Clone)]
pub struct EmbeddingApiClient {
    http: Client,
    endpoint: String,
    model: String,
    batch_size: usize,
    max_retries: u32,
}

impl EmbeddingApiClient {
    pub fn new(config: &EmbeddingsConfig) -> Result<Self> {
        let (provider, model) = parse_provider_model(&config.model);
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or_else(|| default_base_url(provider))
            .trim_end_matches('/');

        let mut headers = HeaderMap::new();
        if let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|e| DriftError::Embedding(format!("Invalid embedding API key: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| DriftError::Embedding(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{base_url}/embeddings"),
            model: model.to_string(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    /// One vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        Ok(vectors)
    }

    /// Embed a single short text and report the vector length.
    pub async fn detect_dimensions(&self) -> Result<usize> {
        let sample = ["dimension check".to_string()];
        let vectors = self.embed_batch(&sample).await?;
        vectors
            .first()
            .map(Vec::len)
            .ok_or_else(|| DriftError::Embedding("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut schedule = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: None,
            ..Default::default()
        };
        schedule.reset();
        let mut attempt = 0;

        loop {
            let (error, hinted_wait) = match self.send(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(Attempt::Abort(error)) => return Err(error),
                Err(Attempt::Retry(error, wait)) => (error, wait),
            };

            if attempt >= self.max_retries {
                return Err(error);
            }
            attempt += 1;

            let wait = hinted_wait
                .or_else(|| schedule.next_backoff())
                .unwrap_or(schedule.max_interval);
            tracing::debug!(
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Retrying embedding request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    async fn send(&self, batch: &[String]) -> std::result::Result<Vec<Vec<f32>>, Attempt> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: batch,
        };

        let response = match self.http.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() || e.is_timeout() => {
                return Err(Attempt::Retry(
                    DriftError::ModelUnavailable(format!(
                        "Embedding endpoint {} unreachable: {e}",
                        self.endpoint
                    )),
                    None,
                ));
            }
            Err(e) => {
                return Err(Attempt::Retry(
                    DriftError::Embedding(format!("Embedding request failed: {e}")),
                    None,
                ));
            }
        };

        let status = response.status();
        if status.is_success() {
            let body: EmbeddingResponse = response.json().await.map_err(|e| {
                Attempt::Abort(DriftError::Embedding(format!(
                    "Invalid embedding response: {e}"
                )))
            })?;
            return into_ordered(body, batch.len()).map_err(Attempt::Abort);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Attempt::Abort(DriftError::ModelUnavailable(format!(
                    "Embedding endpoint rejected credentials ({status}): {body}"
                )))
            }
            StatusCode::TOO_MANY_REQUESTS => Attempt::Retry(
                DriftError::ApiRateLimit { retry_after },
                retry_after.map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER)),
            ),
            s if s.is_server_error() => Attempt::Retry(
                DriftError::Embedding(format!("Embedding server error {status}: {body}")),
                None,
            ),
            _ => Attempt::Abort(DriftError::Embedding(format!(
                "Embedding request rejected ({status}): {body}"
            ))),
        })
    }
}

/// Put vectors back in input order when the server reports indices, and
/// check one vector came back per input.
fn into_ordered(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    let mut data = response.data;
    if data.len() != expected {
        return Err(DriftError::Embedding(format!(
            "Expected {expected} embeddings, got {}",
            data.len()
        )));
    }

    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}
