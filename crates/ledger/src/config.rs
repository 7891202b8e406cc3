//! Ledger client configuration and construction.

use std::sync::Arc;

use munin_common::{MuninError, Result};
use serde::{Deserialize, Serialize};

use crate::client::Ledger;
use crate::http::HttpLedgerClient;
use crate::memory::InMemoryLedger;
use crate::retry::{RetryConfig, RetryingLedger};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// "http" for the real collaborator, "memory" for local development
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// If not set, read from the MUNIN_LEDGER_API_KEY environment variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_backend() -> String {
    "http".into()
}

fn default_base_url() -> String {
    "http://localhost:4400/api/v1".into()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_url: default_base_url(),
            api_key: None,
            retry: RetryConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Resolve the API key from config or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        std::env::var("MUNIN_LEDGER_API_KEY").ok()
    }
}

pub fn build_ledger(config: &LedgerConfig) -> Result<Arc<dyn Ledger>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryLedger::new())),
        "http" => {
            let api_key = config.resolve_api_key().ok_or_else(|| {
                MuninError::Config(
                    "ledger backend \"http\" requires an API key \
                     (set api_key or MUNIN_LEDGER_API_KEY)"
                        .to_string(),
                )
            })?;
            let http = HttpLedgerClient::new(config.base_url.clone(), api_key);
            Ok(Arc::new(RetryingLedger::new(http, config.retry.clone())))
        }
        other => Err(MuninError::Config(format!(
            "Unknown ledger backend: {other}"
        ))),
    }
}
