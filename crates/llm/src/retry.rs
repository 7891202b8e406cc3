//! Retry decorator for transient provider failures.
//!
//! Defaults are tuned for completions made inside a live conversation turn:
//! two retries with sub-second initial backoff, capped well under the turn
//! budget. Authentication and request-shape errors surface immediately.

use std::time::Duration;

use async_trait::async_trait;
use munin_common::{MuninError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::{LlmClient, LlmRequest, LlmResponse};

/// Substrings of provider error messages that mark a completion worth
/// retrying. "request failed" is the prefix both provider clients put on
/// send-path failures (timeouts, resets), so transport errors retry too.
const RETRYABLE_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "500",
    "502",
    "503",
    "504",
    "overloaded",
    "request failed",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            backoff_multiplier: 2.0,
        }
    }
}

pub struct RetryingClient<T: LlmClient> {
    inner: T,
    config: RetryConfig,
}

impl<T: LlmClient> RetryingClient<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn compute_delay(&self, attempt: u32) -> u64 {
        let scaled = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        (scaled as u64).min(self.config.max_delay_ms)
    }
}

/// Only provider errors are candidates; config and ledger errors reaching
/// this layer would be programming mistakes and pass through untouched.
fn is_retryable(error: &MuninError) -> bool {
    let MuninError::Llm(message) = error else {
        return false;
    };
    let lower = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Providers echo the Retry-After header into 429 bodies; honor it when
/// present.
fn parse_retry_after(message: &str) -> Option<u64> {
    let lower = message.to_lowercase();
    let pos = lower.find("retry-after")?;
    let digits: String = lower[pos + "retry-after".len()..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(|secs| secs * 1000)
}

#[async_trait]
impl<T: LlmClient> LlmClient for RetryingClient<T> {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let mut attempt = 0;
        loop {
            let error = match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries || !is_retryable(&error) {
                return Err(error);
            }

            let message = error.to_string();
            let delay = parse_retry_after(&message).unwrap_or_else(|| self.compute_delay(attempt));

            warn!(
                model = self.inner.model_name(),
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay,
                error = %message,
                "Retrying LLM request"
            );

            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_retry_config_stays_under_a_turn() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 4_000);
        // Worst case across all retries is well below the 30s turn budget.
        assert!(config.max_retries as u64 * config.max_delay_ms < 30_000);
    }

    #[test]
    fn retryable_error_detection() {
        assert!(is_retryable(&MuninError::Llm(
            "OpenAI API error 429 Too Many Requests: rate limit exceeded".into()
        )));
        assert!(is_retryable(&MuninError::Llm(
            "Anthropic API error 529: overloaded_error".into()
        )));
        assert!(is_retryable(&MuninError::Llm(
            "OpenAI request failed: operation timed out".into()
        )));
        assert!(!is_retryable(&MuninError::Llm(
            "Anthropic API error 401 Unauthorized".into()
        )));
        assert!(!is_retryable(&MuninError::Llm(
            "Failed to parse OpenAI response: missing field".into()
        )));
        // Non-provider errors never retry, whatever their message says.
        assert!(!is_retryable(&MuninError::Config("endpoint 500".into())));
    }

    #[test]
    fn parse_retry_after_from_error() {
        assert_eq!(
            parse_retry_after("429 Too Many Requests, Retry-After: 5"),
            Some(5000)
        );
        assert_eq!(parse_retry_after("rate limit exceeded"), None);
    }

    #[test]
    fn compute_delay_respects_max() {
        let client = RetryingClient::new(
            FlakyClient::succeeding(),
            RetryConfig {
                max_retries: 5,
                initial_delay_ms: 500,
                max_delay_ms: 2000,
                backoff_multiplier: 10.0,
            },
        );
        assert!(client.compute_delay(5) <= 2000);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = FlakyClient {
            calls: calls.clone(),
            failures: 1,
            error: "OpenAI API error 429 Too Many Requests: rate limit exceeded",
        };

        let client = RetryingClient::new(
            inner,
            RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
        );
        let response = client.complete(LlmRequest::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = FlakyClient {
            calls: calls.clone(),
            failures: u32::MAX,
            error: "OpenAI API error 401 Unauthorized",
        };

        let client = RetryingClient::new(inner, RetryConfig::default());
        let err = client.complete(LlmRequest::default()).await.unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyClient {
        calls: Arc<AtomicU32>,
        failures: u32,
        error: &'static str,
    }

    impl FlakyClient {
        fn succeeding() -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                failures: 0,
                error: "",
            }
        }
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(MuninError::Llm(self.error.to_string()));
            }
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
}
