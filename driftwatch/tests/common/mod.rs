// Common test utilities for integration tests
#![allow(dead_code)]

use std::sync::{Arc, Once};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use driftwatch::config::{AnalysisConfig, Config, DatabaseConfig, LlmConfig};
use driftwatch::db::{Database, DatabaseBackend, LibSqlBackend};
use driftwatch::embeddings::Embedder;
use driftwatch::error::Result;
use driftwatch::llm::LlmProvider;
use driftwatch::models::{Conversation, Message};
use driftwatch::services::DivergenceService;

static INIT: Once = Once::new();

/// Initialize tracing subscriber once for tests
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const COOKING: usize = 0;
pub const ASTRONOMY: usize = 1;
pub const GARDENING: usize = 2;

const TOPIC_KEYWORDS: [&[&str]; 3] = [
    &[
        "pasta", "sauce", "garlic", "recipe", "oven", "basil", "simmer", "dough", "flour", "skillet",
    ],
    &[
        "telescope", "galaxy", "nebula", "orbit", "planet", "comet", "stars", "jupiter", "eyepiece",
        "moon",
    ],
    &[
        "soil", "compost", "seeds", "prune", "mulch", "roses", "watering", "shovel", "harvest",
        "weeds",
    ],
];

const NOISE_DIMS: usize = 29;
const NOISE_WEIGHT: f32 = 0.15;

/// Deterministic embedder: one dimension per known topic, counted from
/// keywords, plus low-weight hashed dimensions for every other word.
pub struct KeywordEmbedder {
    model_id: String,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::with_model("test/keyword-v1")
    }

    pub fn with_model(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
        }
    }

    pub fn embed_text(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; TOPIC_KEYWORDS.len() + NOISE_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            match TOPIC_KEYWORDS.iter().position(|kws| kws.contains(&word.as_str())) {
                Some(topic) => vector[topic] += 1.0,
                None => vector[TOPIC_KEYWORDS.len() + fnv1a(&word) % NOISE_DIMS] += NOISE_WEIGHT,
            }
        }
        vector
    }
}

fn fnv1a(word: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        TOPIC_KEYWORDS.len() + NOISE_DIMS
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// `count` messages about one topic, alternating user and assistant.
pub fn topic_messages(topic: usize, count: usize) -> Vec<Message> {
    let keywords = TOPIC_KEYWORDS[topic];
    (0..count)
        .map(|i| {
            let a = keywords[i % keywords.len()];
            let b = keywords[(i + 3) % keywords.len()];
            let text = format!("Thoughts on {a} with {b}");
            if i % 2 == 0 {
                Message::user(text)
            } else {
                Message::assistant(text)
            }
        })
        .collect()
}

pub fn conversation(id: &str, blocks: &[(usize, usize)]) -> Conversation {
    let messages = blocks
        .iter()
        .flat_map(|&(topic, count)| topic_messages(topic, count))
        .collect();
    let mut conversation = Conversation::new(id, messages);
    conversation.title = Some(format!("Conversation {id}"));
    conversation
}

/// A conversation created `days_ago` days in the past.
pub fn aged_conversation(id: &str, blocks: &[(usize, usize)], days_ago: i64) -> Conversation {
    let mut conversation = conversation(id, blocks);
    let at = Utc::now() - Duration::days(days_ago);
    conversation.created_at = at;
    conversation.updated_at = at;
    conversation
}

pub async fn test_database() -> (Arc<dyn DatabaseBackend>, TempDir) {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = temp_dir.path().join("driftwatch_test.db");

    let config = DatabaseConfig {
        url: format!("file:{}", db_path.display()),
        auth_token: None,
        local_path: None,
    };

    let db = Database::new(&config)
        .await
        .expect("failed to create test database");

    (Arc::new(LibSqlBackend::new(db)), temp_dir)
}

pub fn test_config(llm: Option<LlmConfig>) -> Config {
    let mut config = Config::default();
    config.analysis = AnalysisConfig::default();
    config.llm = llm;
    config.server.api_keys = vec!["test-key".to_string()];
    config
}

pub fn test_llm_config(base_url: String) -> LlmConfig {
    LlmConfig {
        model: "openai/gpt-4o-mini".to_string(),
        api_key: Some("test-key".to_string()),
        base_url: Some(base_url),
        timeout_secs: 5,
        max_retries: 0,
        concurrency: 4,
        generate_summaries: false,
    }
}

pub fn service_with(
    db: Arc<dyn DatabaseBackend>,
    embedder: Arc<dyn Embedder>,
    llm: Option<LlmConfig>,
) -> DivergenceService {
    service_from_config(&test_config(llm), db, embedder)
}

pub fn service_from_config(
    config: &Config,
    db: Arc<dyn DatabaseBackend>,
    embedder: Arc<dyn Embedder>,
) -> DivergenceService {
    let provider = Arc::new(LlmProvider::new(config.llm.as_ref()));
    DivergenceService::new(config, db, embedder, provider)
}

pub fn test_service(db: Arc<dyn DatabaseBackend>) -> DivergenceService {
    service_with(db, Arc::new(KeywordEmbedder::new()), None)
}
