//! Client for the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use munin_common::{MuninError, Result};
use serde::{Deserialize, Serialize};

use crate::client::{ChatRole, LlmClient, LlmRequest, LlmResponse, TokenUsage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires max_tokens; this is the fallback when the
/// caller leaves it unset.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WireContent<'a>>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Deserialize)]
struct MessagesReply {
    content: Vec<ReplyContent>,
    model: String,
    usage: Option<WireUsage>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

pub struct AnthropicClient {
    model: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            model,
            api_key,
            http_client: reqwest::Client::new(),
        }
    }

    /// System messages go in the top-level `system` field, not the message
    /// list, so only user and assistant turns are serialized here.
    fn messages_body<'a>(&'a self, request: &'a LlmRequest) -> MessagesBody<'a> {
        let messages = request
            .messages
            .iter()
            .filter(|msg| msg.role != ChatRole::System)
            .map(|msg| WireMessage {
                role: match msg.role {
                    ChatRole::Assistant => "assistant",
                    _ => "user",
                },
                content: vec![WireContent {
                    kind: "text",
                    text: &msg.content,
                }],
            })
            .collect();

        MessagesBody {
            model: &self.model,
            messages,
            system: request.system_prompt.as_deref(),
            temperature: request.temperature,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let response = self
            .http_client
            .post(ANTHROPIC_API_URL)
            .timeout(REQUEST_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.messages_body(&request))
            .send()
            .await
            .map_err(|e| MuninError::Llm(format!("Anthropic request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(MuninError::Llm(format!(
                "Anthropic API error {status}: {body_text}"
            )));
        }

        let reply: MessagesReply = response
            .json()
            .await
            .map_err(|e| MuninError::Llm(format!("Failed to parse Anthropic response: {e}")))?;

        let content = reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: reply.model,
            usage: reply.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
            }),
            finish_reason: reply.stop_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
