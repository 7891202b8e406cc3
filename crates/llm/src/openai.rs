//! Client for OpenAI-compatible chat completion endpoints.
//!
//! The default base URL points at a local Ollama instance, which is how
//! Munin runs in development: no API key, a small local model, and the
//! same wire format as the hosted service.

use std::time::Duration;

use async_trait::async_trait;
use munin_common::{MuninError, Result};
use serde::{Deserialize, Serialize};

use crate::client::{ChatRole, LlmClient, LlmRequest, LlmResponse, TokenUsage};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// A completion blocks a live conversation turn, so a hung provider must
/// not be allowed to hold the turn open indefinitely.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Vec<Choice>,
    model: String,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, model: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            api_key,
            http_client: reqwest::Client::new(),
        }
    }

    fn completion_body<'a>(&'a self, request: &'a LlmRequest) -> CompletionBody<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system_prompt {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|msg| WireMessage {
            role: msg.role.as_str(),
            content: &msg.content,
        }));

        CompletionBody {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));

        let mut http_req = self
            .http_client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&self.completion_body(&request));
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| MuninError::Llm(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(MuninError::Llm(format!(
                "OpenAI API error {status}: {body_text}"
            )));
        }

        let reply: CompletionReply = response
            .json()
            .await
            .map_err(|e| MuninError::Llm(format!("Failed to parse OpenAI response: {e}")))?;

        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| MuninError::Llm("No choices in OpenAI response".to_string()))?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: reply.model,
            usage: reply.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChatMessage;

    #[test]
    fn completion_body_matches_openai_format() {
        let client = OpenAiClient::new(None, "gpt-4o-mini".to_string(), Some("sk-unit".to_string()));
        let request = LlmRequest {
            system_prompt: Some("You route bookkeeping requests.".to_string()),
            messages: vec![ChatMessage::user("lag en faktura")],
            temperature: Some(0.2),
            max_tokens: Some(256),
        };

        let json = serde_json::to_value(client.completion_body(&request)).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        let temp = json["temperature"].as_f64().unwrap();
        assert!((temp - 0.2).abs() < 0.001);
        assert_eq!(json["max_tokens"], 256);

        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You route bookkeeping requests.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "lag en faktura");
    }

    #[test]
    fn completion_body_omits_optional_fields() {
        let client = OpenAiClient::new(None, "gpt-4o-mini".to_string(), None);
        let request = LlmRequest {
            system_prompt: None,
            messages: vec![ChatMessage::user("hei")],
            temperature: None,
            max_tokens: None,
        };

        let json = serde_json::to_value(client.completion_body(&request)).unwrap();

        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn default_base_url_is_local_ollama() {
        let client = OpenAiClient::new(None, "llama3.2".to_string(), None);
        assert_eq!(client.base_url, "http://localhost:11434");
    }
}
