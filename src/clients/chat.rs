//! HTTP chat-completion client (OpenAI-compatible API)
//!
//! Works against any gateway exposing /v1/chat/completions; the gateway
//! handles provider routing and budget enforcement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use super::{Chat, ChatReply, ChatRequest, ProviderUsage};
use crate::error::{Error, Result};

/// Chat client speaking the OpenAI chat-completions wire format
#[derive(Clone)]
pub struct GatewayChatClient {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl GatewayChatClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { api_key, client, base_url }
    }

    /// Create from environment.
    ///
    /// Reads `LLM_GATEWAY_API_KEY` (required) and `LLM_GATEWAY_URL`
    /// (default: http://localhost:9002).
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("LLM_GATEWAY_API_KEY")
            .map_err(|_| Error::Configuration("LLM_GATEWAY_API_KEY not set".to_string()))?;
        let base_url = env::var("LLM_GATEWAY_URL").unwrap_or_else(|_| {
            tracing::warn!("LLM_GATEWAY_URL not set, using default localhost:9002");
            "http://localhost:9002".to_string()
        });
        Ok(Self::new(api_key, base_url))
    }
}

// OpenAI-compatible API structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl Chat for GatewayChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply> {
        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: request.prompt,
        });

        let wire_request = ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
            response_format: request
                .json_output
                .then_some(ResponseFormat { format_type: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| Error::Upstream {
                service: "llm",
                detail: format!("request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error response".to_string());
            return Err(Error::Upstream {
                service: "llm",
                detail: format!("gateway error ({status}): {error_text}"),
            });
        }

        let wire_response: ChatCompletionResponse =
            response.json().await.map_err(|e| Error::Upstream {
                service: "llm",
                detail: format!("failed to parse response: {e}"),
            })?;

        let content = wire_response
            .choices
            .first()
            .ok_or_else(|| Error::Upstream {
                service: "llm",
                detail: "no choices in response".to_string(),
            })?
            .message
            .content
            .clone();

        Ok(ChatReply {
            content,
            model: wire_response.model,
            usage: ProviderUsage {
                input_tokens: wire_response.usage.prompt_tokens,
                output_tokens: wire_response.usage.completion_tokens,
            },
        })
    }
}
