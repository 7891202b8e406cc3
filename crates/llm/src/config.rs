//! Provider selection and client assembly.
//!
//! `build_llm_client` stacks the decorators every caller wants: the raw
//! provider client, retry on transient failures, and a concurrency cap.

use std::sync::Arc;

use async_trait::async_trait;
use munin_common::{MuninError, Result};
use serde::{Deserialize, Serialize};

use crate::anthropic::AnthropicClient;
use crate::client::{LlmClient, LlmRequest, LlmResponse};
use crate::openai::OpenAiClient;
use crate::retry::{RetryConfig, RetryingClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai" (hosted or a local Ollama) or "anthropic".
    pub provider: String,
    pub model: String,

    /// If not set, read from OPENAI_API_KEY or ANTHROPIC_API_KEY depending
    /// on the provider. Ollama needs no key at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrent() -> usize {
    2
}

impl LlmConfig {
    /// Resolve the API key from config or the provider's conventional
    /// environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let var = match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY",
            "anthropic" => "ANTHROPIC_API_KEY",
            _ => return None,
        };
        std::env::var(var).ok()
    }
}

/// Caps in-flight completions so the coordinator and six workers sharing one
/// provider cannot stampede it.
pub struct SemaphoredClient {
    inner: Arc<dyn LlmClient>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl SemaphoredClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_concurrent)),
        }
    }
}

#[async_trait]
impl LlmClient for SemaphoredClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| MuninError::Llm(format!("completion slot unavailable: {e}")))?;
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

pub fn build_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let api_key = config.resolve_api_key();

    let base_client: Box<dyn LlmClient> = match config.provider.as_str() {
        "openai" => Box::new(OpenAiClient::new(
            config.api_url.clone(),
            config.model.clone(),
            api_key,
        )),
        "anthropic" => {
            let api_key = api_key.ok_or_else(|| {
                MuninError::Config(
                    "LLM provider \"anthropic\" requires an API key \
                     (set api_key or ANTHROPIC_API_KEY)"
                        .to_string(),
                )
            })?;
            Box::new(AnthropicClient::new(config.model.clone(), api_key))
        }
        other => {
            return Err(MuninError::Config(format!(
                "Unknown LLM provider: {other}"
            )));
        }
    };

    let retrying: Box<dyn LlmClient> =
        Box::new(RetryingClient::new(base_client, config.retry.clone()));
    let semaphored = SemaphoredClient::new(Arc::from(retrying), config.max_concurrent_requests);

    Ok(Arc::new(semaphored))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_CONFIG: &str = r#"
provider = "openai"
model = "llama3.2"
api_url = "http://localhost:11434"
max_concurrent_requests = 4

[retry]
max_retries = 3
initial_delay_ms = 400
max_delay_ms = 8000
backoff_multiplier = 2.5
"#;

    fn openai_config() -> LlmConfig {
        LlmConfig {
            provider: "openai".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            api_url: None,
            max_concurrent_requests: 2,
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn deserialize_config_from_toml() {
        let config: LlmConfig = toml::from_str(TOML_CONFIG).unwrap();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.api_url.as_deref(), Some("http://localhost:11434"));
        assert!(config.api_key.is_none());
        assert_eq!(config.max_concurrent_requests, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 400);
    }

    #[test]
    fn deserialize_config_defaults() {
        let toml_str = r#"
provider = "anthropic"
model = "claude-3-5-haiku-20241022"
api_key = "sk-ant-dummy"
"#;
        let config: LlmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrent_requests, 2);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay_ms, 250);
    }

    #[test]
    fn explicit_key_wins_over_environment() {
        let config = LlmConfig {
            api_key: Some("sk-explicit".into()),
            ..openai_config()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn build_openai_client_without_key() {
        let client = build_llm_client(&openai_config()).unwrap();
        assert_eq!(client.model_name(), "llama3.2");
    }

    #[test]
    fn build_anthropic_client() {
        let config = LlmConfig {
            provider: "anthropic".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key: Some("sk-ant-dummy".to_string()),
            ..openai_config()
        };
        let client = build_llm_client(&config).unwrap();
        assert_eq!(client.model_name(), "claude-3-5-haiku-20241022");
    }

    #[test]
    fn build_unknown_provider_fails() {
        let config = LlmConfig {
            provider: "mistral".to_string(),
            model: "mistral-small".to_string(),
            ..openai_config()
        };
        assert!(build_llm_client(&config).is_err());
    }

    #[tokio::test]
    async fn semaphored_client_limits_concurrency() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct GaugeClient {
            in_flight: Arc<AtomicU32>,
            peak: Arc<AtomicU32>,
        }

        #[async_trait]
        impl LlmClient for GaugeClient {
            async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(LlmResponse {
                    content: "ok".to_string(),
                    model: "test".to_string(),
                    usage: None,
                    finish_reason: None,
                })
            }
            fn model_name(&self) -> &str {
                "test"
            }
        }

        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let inner = Arc::new(GaugeClient {
            in_flight: in_flight.clone(),
            peak: peak.clone(),
        });

        let semaphored = Arc::new(SemaphoredClient::new(inner, 2));

        let mut handles = vec![];
        for _ in 0..6 {
            let client = semaphored.clone();
            handles.push(tokio::spawn(async move {
                client.complete(LlmRequest::default()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
