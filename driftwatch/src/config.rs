use serde::Deserialize;
use std::env;

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embeddings: EmbeddingsConfig,
    pub analysis: AnalysisConfig,
    pub processing: ProcessingConfig,
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_keys: Vec<String>,
    /// Upper bound on request bodies; ingest payloads carry whole conversations.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub local_path: Option<String>,
}

/// Embedding model selection. `model` uses the `provider/model` form; a bare
/// model name means a local fastembed model.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// LLM configuration for the relevance judge and segment summaries.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Maximum in-flight classification calls per conversation.
    pub concurrency: usize,
    pub generate_summaries: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub worker_count: usize,
    pub channel_capacity: usize,
    pub ingest_priority: i64,
    pub watcher_priority: i64,
    /// Conversations fetched per checkpoint query.
    pub poll_page_size: usize,
    /// Processing entries older than this are presumed orphaned by a crash
    /// and returned to pending when background processing starts.
    pub stale_processing_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            batch_size: 50,
            worker_count: 2,
            channel_capacity: 64,
            ingest_priority: 1,
            watcher_priority: 0,
            poll_page_size: 500,
            stale_processing_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisConfig {
    pub drift: DriftConfig,
    pub topics: TopicConfig,
    pub ensemble: EnsembleConfig,
    pub linker: LinkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriftConfig {
    /// Number of leading messages averaged into the anchor.
    pub anchor_window: usize,
    pub threshold: f64,
    /// Messages the drift must stay above `threshold` for a changepoint.
    pub persistence_window: usize,
    /// Drift under this value after exceeding `threshold` counts as a return.
    pub return_threshold: f64,
    /// Mean drift that maps to a component score of 1.0.
    pub normalizer: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            anchor_window: 3,
            threshold: 0.35,
            persistence_window: 3,
            return_threshold: 0.15,
            normalizer: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub min_messages: usize,
    pub max_topics: usize,
    pub min_topic_size: usize,
    /// Best silhouette below this keeps the whole conversation as one topic.
    pub min_silhouette: f64,
    pub max_iterations: usize,
    pub label_terms: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            min_messages: 8,
            max_topics: 8,
            min_topic_size: 2,
            min_silhouette: 0.1,
            max_iterations: 50,
            label_terms: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentWeights {
    pub drift: f64,
    pub entropy: f64,
    pub transition: f64,
    pub relevance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnsembleConfig {
    pub drift_votes: u32,
    pub topic_votes: u32,
    pub llm_votes: u32,
    pub vote_threshold: u32,
    /// Votes within this many messages of each other count toward one boundary.
    pub boundary_tolerance: usize,
    pub min_segment_messages: usize,
    pub split_threshold: f64,
    pub max_boundaries: usize,
    pub weights_with_llm: ComponentWeights,
    pub weights_without_llm: ComponentWeights,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            drift_votes: 1,
            topic_votes: 1,
            llm_votes: 2,
            vote_threshold: 2,
            boundary_tolerance: 1,
            min_segment_messages: 3,
            split_threshold: 0.6,
            max_boundaries: 2,
            weights_with_llm: ComponentWeights {
                drift: 0.35,
                entropy: 0.20,
                transition: 0.20,
                relevance: 0.25,
            },
            weights_without_llm: ComponentWeights {
                drift: 0.45,
                entropy: 0.30,
                transition: 0.25,
                relevance: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkerConfig {
    pub similarity_floor: f64,
    pub continues_threshold: f64,
    pub branch_divergence: f64,
    pub max_links_per_segment: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.5,
            continues_threshold: 0.8,
            branch_divergence: 0.5,
            max_links_per_segment: 5,
        }
    }
}

impl AnalysisConfig {
    fn from_env() -> Self {
        let drift = DriftConfig::default();
        let topics = TopicConfig::default();
        let ensemble = EnsembleConfig::default();
        let linker = LinkerConfig::default();

        Self {
            drift: DriftConfig {
                anchor_window: parse_env_or("DRIFT_ANCHOR_WINDOW", drift.anchor_window).max(1),
                threshold: parse_env_or("DRIFT_THRESHOLD", drift.threshold),
                persistence_window: parse_env_or(
                    "DRIFT_PERSISTENCE_WINDOW",
                    drift.persistence_window,
                )
                .max(1),
                return_threshold: parse_env_or("DRIFT_RETURN_THRESHOLD", drift.return_threshold),
                normalizer: parse_env_or("DRIFT_NORMALIZER", drift.normalizer),
            },
            topics: TopicConfig {
                min_messages: parse_env_or("TOPIC_MIN_MESSAGES", topics.min_messages),
                max_topics: parse_env_or("TOPIC_MAX_TOPICS", topics.max_topics).max(1),
                min_topic_size: parse_env_or("TOPIC_MIN_SIZE", topics.min_topic_size).max(1),
                min_silhouette: parse_env_or("TOPIC_MIN_SILHOUETTE", topics.min_silhouette),
                max_iterations: parse_env_or("TOPIC_MAX_ITERATIONS", topics.max_iterations),
                label_terms: parse_env_or("TOPIC_LABEL_TERMS", topics.label_terms),
            },
            ensemble: EnsembleConfig {
                drift_votes: parse_env_or("ENSEMBLE_DRIFT_VOTES", ensemble.drift_votes),
                topic_votes: parse_env_or("ENSEMBLE_TOPIC_VOTES", ensemble.topic_votes),
                llm_votes: parse_env_or("ENSEMBLE_LLM_VOTES", ensemble.llm_votes),
                vote_threshold: parse_env_or("ENSEMBLE_VOTE_THRESHOLD", ensemble.vote_threshold),
                boundary_tolerance: parse_env_or(
                    "ENSEMBLE_BOUNDARY_TOLERANCE",
                    ensemble.boundary_tolerance,
                ),
                min_segment_messages: parse_env_or(
                    "ENSEMBLE_MIN_SEGMENT_MESSAGES",
                    ensemble.min_segment_messages,
                ),
                split_threshold: parse_env_or("ENSEMBLE_SPLIT_THRESHOLD", ensemble.split_threshold),
                max_boundaries: parse_env_or("ENSEMBLE_MAX_BOUNDARIES", ensemble.max_boundaries),
                weights_with_llm: ComponentWeights {
                    drift: parse_env_or("WEIGHT_LLM_DRIFT", ensemble.weights_with_llm.drift),
                    entropy: parse_env_or("WEIGHT_LLM_ENTROPY", ensemble.weights_with_llm.entropy),
                    transition: parse_env_or(
                        "WEIGHT_LLM_TRANSITION",
                        ensemble.weights_with_llm.transition,
                    ),
                    relevance: parse_env_or(
                        "WEIGHT_LLM_RELEVANCE",
                        ensemble.weights_with_llm.relevance,
                    ),
                },
                weights_without_llm: ComponentWeights {
                    drift: parse_env_or("WEIGHT_DRIFT", ensemble.weights_without_llm.drift),
                    entropy: parse_env_or("WEIGHT_ENTROPY", ensemble.weights_without_llm.entropy),
                    transition: parse_env_or(
                        "WEIGHT_TRANSITION",
                        ensemble.weights_without_llm.transition,
                    ),
                    relevance: 0.0,
                },
            },
            linker: LinkerConfig {
                similarity_floor: parse_env_or("LINK_SIMILARITY_FLOOR", linker.similarity_floor),
                continues_threshold: parse_env_or(
                    "LINK_CONTINUES_THRESHOLD",
                    linker.continues_threshold,
                ),
                branch_divergence: parse_env_or("LINK_BRANCH_DIVERGENCE", linker.branch_divergence),
                max_links_per_segment: parse_env_or(
                    "LINK_MAX_PER_SEGMENT",
                    linker.max_links_per_segment,
                ),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let processing = ProcessingConfig::default();

        Self {
            server: ServerConfig {
                host: env::var("DRIFTWATCH_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_env_or("DRIFTWATCH_PORT", 3100),
                api_keys: env::var("DRIFTWATCH_API_KEYS")
                    .map(|keys| {
                        keys.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                max_body_bytes: parse_env_or("DRIFTWATCH_MAX_BODY_BYTES", 16 * 1024 * 1024),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "file:driftwatch.db".to_string()),
                auth_token: env::var("DATABASE_AUTH_TOKEN").ok(),
                local_path: env::var("DATABASE_LOCAL_PATH").ok(),
            },
            embeddings: EmbeddingsConfig {
                model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "all-MiniLM-L6-v2".to_string()),
                dimensions: parse_env_or("EMBEDDING_DIMENSIONS", 384),
                batch_size: parse_env_or("EMBEDDING_BATCH_SIZE", 64),
                api_key: env::var("EMBEDDING_API_KEY").ok(),
                base_url: env::var("EMBEDDING_BASE_URL").ok(),
                timeout_secs: parse_env_or("EMBEDDING_TIMEOUT", 30),
                max_retries: parse_env_or("EMBEDDING_MAX_RETRIES", 3),
            },
            analysis: AnalysisConfig::from_env(),
            processing: ProcessingConfig {
                poll_interval_secs: parse_env_or("POLL_INTERVAL_SECS", processing.poll_interval_secs),
                batch_size: parse_env_or("PROCESSING_BATCH_SIZE", processing.batch_size).max(1),
                worker_count: parse_env_or("PROCESSING_WORKERS", processing.worker_count).max(1),
                channel_capacity: parse_env_or("PROCESSING_CHANNEL_CAPACITY", processing.channel_capacity)
                    .max(1),
                ingest_priority: parse_env_or("INGEST_PRIORITY", processing.ingest_priority),
                watcher_priority: parse_env_or("WATCHER_PRIORITY", processing.watcher_priority),
                poll_page_size: parse_env_or("POLL_PAGE_SIZE", processing.poll_page_size).max(1),
                stale_processing_secs: parse_env_or(
                    "STALE_PROCESSING_SECS",
                    processing.stale_processing_secs,
                ),
            },
            llm: env::var("LLM_MODEL").ok().map(|model| LlmConfig {
                model,
                api_key: env::var("LLM_API_KEY").ok(),
                base_url: env::var("LLM_BASE_URL").ok(),
                timeout_secs: parse_env_or("LLM_TIMEOUT", 30),
                max_retries: parse_env_or("LLM_MAX_RETRIES", 3),
                concurrency: parse_env_opt("LLM_CONCURRENCY").unwrap_or(4).max(1),
                generate_summaries: parse_env_or("LLM_GENERATE_SUMMARIES", false),
            }),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

/// Known embedding providers that use OpenAI-compatible APIs
const KNOWN_PROVIDERS: &[&str] = &["openai", "openrouter", "ollama", "lmstudio", "local"];

/// Known LLM providers that use OpenAI-compatible APIs
pub const KNOWN_LLM_PROVIDERS: &[&str] = &["openai", "openrouter", "ollama", "lmstudio"];

/// Parse a model name into (provider, model) tuple.
pub fn parse_provider_model(model: &str) -> (&str, &str) {
    if let Some((prefix, rest)) = model.split_once('/') {
        let prefix_lower = prefix.to_lowercase();
        if KNOWN_PROVIDERS.contains(&prefix_lower.as_str()) {
            return (prefix, rest);
        }
    }
    ("local", model)
}

/// Parse an LLM model name into (provider, model) tuple.
pub fn parse_llm_provider_model(model: &str) -> (&str, &str) {
    if let Some((prefix, rest)) = model.split_once('/') {
        let prefix_lower = prefix.to_lowercase();
        if KNOWN_LLM_PROVIDERS.contains(&prefix_lower.as_str()) {
            return (prefix, rest);
        }
    }
    ("local", model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_analysis_defaults() {
        std::env::remove_var("DRIFT_THRESHOLD");
        std::env::remove_var("ENSEMBLE_VOTE_THRESHOLD");

        let config = Config::default();
        assert_eq!(config.analysis.drift.anchor_window, 3);
        assert_eq!(config.analysis.drift.threshold, 0.35);
        assert_eq!(config.analysis.topics.min_messages, 8);
        assert_eq!(config.analysis.ensemble.vote_threshold, 2);
        assert_eq!(config.analysis.ensemble.llm_votes, 2);
        assert_eq!(config.analysis.ensemble.split_threshold, 0.6);
        assert_eq!(config.analysis.linker.similarity_floor, 0.5);
    }

    #[test]
    fn test_default_weight_sets_sum_to_one() {
        let ensemble = EnsembleConfig::default();
        let with = &ensemble.weights_with_llm;
        let without = &ensemble.weights_without_llm;
        assert!((with.drift + with.entropy + with.transition + with.relevance - 1.0).abs() < 1e-9);
        assert!((without.drift + without.entropy + without.transition - 1.0).abs() < 1e-9);
    }

    #[test]
    #[serial]
    fn test_analysis_overrides_from_env() {
        std::env::set_var("DRIFT_THRESHOLD", "0.5");
        std::env::set_var("ENSEMBLE_VOTE_THRESHOLD", "3");
        std::env::set_var("DRIFT_ANCHOR_WINDOW", "0");

        let config = Config::default();
        assert_eq!(config.analysis.drift.threshold, 0.5);
        assert_eq!(config.analysis.ensemble.vote_threshold, 3);
        assert_eq!(config.analysis.drift.anchor_window, 1);

        std::env::remove_var("DRIFT_THRESHOLD");
        std::env::remove_var("ENSEMBLE_VOTE_THRESHOLD");
        std::env::remove_var("DRIFT_ANCHOR_WINDOW");
    }

    #[test]
    #[serial]
    fn test_llm_config_defaults() {
        std::env::remove_var("LLM_MODEL");
        std::env::remove_var("LLM_CONCURRENCY");

        let config = Config::default();
        assert!(config.llm.is_none());

        std::env::set_var("LLM_MODEL", "openai/gpt-4o-mini");
        let config = Config::default();
        let llm = config.llm.expect("llm config should be present");
        assert_eq!(llm.model, "openai/gpt-4o-mini");
        assert_eq!(llm.concurrency, 4);
        assert!(!llm.generate_summaries);

        std::env::remove_var("LLM_MODEL");
    }

    #[test]
    #[serial]
    fn test_invalid_value_falls_back_to_default() {
        std::env::set_var("POLL_INTERVAL_SECS", "soon");
        let config = Config::default();
        assert_eq!(config.processing.poll_interval_secs, 300);
        std::env::remove_var("POLL_INTERVAL_SECS");
    }

    #[test]
    fn test_parse_provider_model() {
        assert_eq!(
            parse_provider_model("openai/text-embedding-3-small"),
            ("openai", "text-embedding-3-small")
        );
        assert_eq!(
            parse_provider_model("BAAI/bge-small-en-v1.5"),
            ("local", "BAAI/bge-small-en-v1.5")
        );
        assert_eq!(parse_llm_provider_model("ollama/llama3"), ("ollama", "llama3"));
    }
}
