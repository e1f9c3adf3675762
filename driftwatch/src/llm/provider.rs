use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::{DriftError, Result};
use crate::llm::api::LlmApiClient;

#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

#[derive(Clone)]
enum LlmBackend {
    Api(LlmApiClient),
    Unavailable { reason: String },
}

/// Optional LLM access. Built once at startup; when no model is configured
/// or the client cannot be created every call fails with `LlmUnavailable`.
#[derive(Clone)]
pub struct LlmProvider {
    backend: LlmBackend,
    config: Option<LlmConfig>,
}

impl LlmProvider {
    pub fn new(config: Option<&LlmConfig>) -> Self {
        let Some(config) = config else {
            return Self::unavailable("No LLM configuration provided");
        };

        match LlmApiClient::new(config) {
            Ok(client) => {
                tracing::info!(model = %client.model(), "LLM provider configured");
                Self {
                    backend: LlmBackend::Api(client),
                    config: Some(config.clone()),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "LLM provider disabled");
                Self {
                    backend: LlmBackend::Unavailable {
                        reason: err.to_string(),
                    },
                    config: Some(config.clone()),
                }
            }
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            backend: LlmBackend::Unavailable {
                reason: reason.to_string(),
            },
            config: None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.backend, LlmBackend::Api(_))
    }

    pub fn config(&self) -> Option<&LlmConfig> {
        self.config.as_ref()
    }

    /// Maximum in-flight calls for one conversation.
    pub fn concurrency(&self) -> usize {
        self.config.as_ref().map(|c| c.concurrency.max(1)).unwrap_or(1)
    }

    pub fn generate_summaries(&self) -> bool {
        self.is_available() && self.config.as_ref().is_some_and(|c| c.generate_summaries)
    }

    /// Upper bound for a single call including retries.
    pub fn call_timeout(&self) -> std::time::Duration {
        let config = self.config.as_ref();
        let timeout = config.map(|c| c.timeout_secs).unwrap_or(30).max(1);
        let attempts = config.map(|c| c.max_retries).unwrap_or(0) as u64 + 1;
        std::time::Duration::from_secs(timeout * attempts + 1)
    }

    fn client(&self) -> Result<&LlmApiClient> {
        match &self.backend {
            LlmBackend::Api(client) => Ok(client),
            LlmBackend::Unavailable { reason } => Err(DriftError::LlmUnavailable(reason.clone())),
        }
    }

    pub async fn complete(
        &self,
        prompt: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<String> {
        self.client()?.complete(prompt, None, options).await
    }

    pub async fn complete_json(
        &self,
        prompt: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<Value> {
        self.client()?.complete_json(prompt, options).await
    }

    pub async fn complete_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        options: Option<&CompletionOptions>,
    ) -> Result<T> {
        let json_value = self.complete_json(prompt, options).await?;

        serde_json::from_value(json_value)
            .map_err(|e| DriftError::Llm(format!("Failed to deserialize response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_provider_is_unavailable() {
        let provider = LlmProvider::new(None);
        assert!(!provider.is_available());
        assert!(!provider.generate_summaries());
        assert_eq!(provider.concurrency(), 1);

        let err = provider.complete("hello", None).await.unwrap_err();
        assert!(matches!(err, DriftError::LlmUnavailable(_)));
        assert!(err.is_fatal_llm());
    }

    #[test]
    fn test_missing_key_disables_provider() {
        let config = LlmConfig {
            model: "openai/gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            timeout_secs: 10,
            max_retries: 2,
            concurrency: 8,
            generate_summaries: true,
        };
        let provider = LlmProvider::new(Some(&config));
        assert!(!provider.is_available());
        assert!(!provider.generate_summaries());
        assert_eq!(provider.concurrency(), 8);
        assert_eq!(provider.call_timeout().as_secs(), 31);
    }
}
