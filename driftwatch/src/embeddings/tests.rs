//! Embedding API client and provider tests against a mock server.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::config::{parse_provider_model, EmbeddingsConfig};
use crate::embeddings::api::EmbeddingApiClient;
use crate::embeddings::{Embedder, EmbeddingProvider};
use crate::error::DriftError;

fn api_config(base_url: &str) -> EmbeddingsConfig {
    EmbeddingsConfig {
        model: "openai/text-embedding-3-small".to_string(),
        dimensions: 2,
        batch_size: 16,
        api_key: Some("test-api-key".to_string()),
        base_url: Some(base_url.to_string()),
        timeout_secs: 10,
        max_retries: 2,
    }
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|t| t.to_string()).collect()
}

fn embedding_response(embeddings: Vec<Vec<f32>>) -> serde_json::Value {
    json!({
        "data": embeddings.into_iter().map(|e| json!({ "embedding": e })).collect::<Vec<_>>()
    })
}

/// Answers with one 2-d vector per input, echoing the batch size in the
/// first component.
struct EchoBatch;

impl Respond for EchoBatch {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let count = body["input"].as_array().map_or(0, Vec::len);
        let vectors = (0..count).map(|_| vec![count as f32, 1.0]).collect();
        ResponseTemplate::new(200).set_body_json(embedding_response(vectors))
    }
}

#[tokio::test]
async fn test_request_carries_bare_model_and_bearer_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer test-api-key"))
        .and(body_json(json!({
            "model": "text-embedding-3-small",
            "input": ["first", "second"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(embedding_response(vec![
            vec![0.1, 0.2],
            vec![0.3, 0.4],
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let embeddings = client.embed(&texts(&["first", "second"])).await.unwrap();

    assert_eq!(embeddings, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
}

#[tokio::test]
async fn test_vectors_follow_reported_indices() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        })))
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let embeddings = client.embed(&texts(&["a", "b"])).await.unwrap();

    assert_eq!(embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn test_short_response_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(embedding_response(vec![vec![1.0, 0.0]])),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let result = client.embed(&texts(&["a", "b"])).await;

    assert!(matches!(result, Err(DriftError::Embedding(ref msg)) if msg.contains("Expected 2")));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let mock_server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(move |_: &Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503).set_body_string("warming up")
            } else {
                ResponseTemplate::new(200).set_body_json(embedding_response(vec![vec![1.0, 0.0]]))
            }
        })
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let embeddings = client.embed(&texts(&["retry me"])).await.unwrap();

    assert_eq!(embeddings.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_key_means_model_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let result = client.embed(&texts(&["text"])).await;

    assert!(
        matches!(result, Err(DriftError::ModelUnavailable(ref msg)) if msg.contains("bad key"))
    );
}

#[tokio::test]
async fn test_unreachable_endpoint_means_model_unavailable() {
    // Bind then drop a listener so the port is known to be closed.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut config = api_config(&format!("http://127.0.0.1:{port}"));
    config.max_retries = 1;

    let client = EmbeddingApiClient::new(&config).unwrap();
    let result = client.embed(&texts(&["text"])).await;

    assert!(matches!(result, Err(DriftError::ModelUnavailable(ref msg)) if msg.contains("unreachable")));
}

#[tokio::test]
async fn test_rate_limit_exhausts_retries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = EmbeddingApiClient::new(&api_config(&mock_server.uri())).unwrap();
    let result = client.embed(&texts(&["text"])).await;

    assert!(matches!(
        result,
        Err(DriftError::ApiRateLimit {
            retry_after: Some(1)
        })
    ));
}

#[tokio::test]
async fn test_client_splits_batches() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(EchoBatch)
        .expect(3)
        .mount(&mock_server)
        .await;

    let mut config = api_config(&mock_server.uri());
    config.batch_size = 2;
    config.max_retries = 0;
    let provider = EmbeddingProvider::new(&config).unwrap();

    assert!(!provider.is_local());
    assert_eq!(Embedder::model_id(&provider), "openai/text-embedding-3-small");

    let messages: Vec<String> = (0..5).map(|i| format!("message {i}")).collect();
    let embeddings = provider.embed(messages).await.unwrap();

    let batch_sizes: Vec<f32> = embeddings.iter().map(|e| e[0]).collect();
    assert_eq!(batch_sizes, vec![2.0, 2.0, 2.0, 2.0, 1.0]);
}

#[tokio::test]
async fn test_init_checks_api_dimensions() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(EchoBatch)
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = EmbeddingProvider::new(&EmbeddingsConfig {
        model: "ollama/nomic-embed-text".to_string(),
        dimensions: 768,
        batch_size: 8,
        api_key: None,
        base_url: Some(mock_server.uri()),
        timeout_secs: 5,
        max_retries: 0,
    })
    .unwrap();

    provider.init().await.unwrap();
}

#[test]
fn test_provider_parsing() {
    assert_eq!(
        parse_provider_model("openai/text-embedding-3-small"),
        ("openai", "text-embedding-3-small")
    );
    assert_eq!(
        parse_provider_model("BAAI/bge-small-en-v1.5"),
        ("local", "BAAI/bge-small-en-v1.5")
    );
    assert_eq!(parse_provider_model("all-MiniLM-L6-v2"), ("local", "all-MiniLM-L6-v2"));
}
