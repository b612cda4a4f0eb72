//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint implementing the `/v1/chat/completions`
//! shape, including local inference servers. The API key is optional for
//! endpoints that do not authenticate.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, ProviderError};

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(serde::Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    model: Option<String>,
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    /// Create a client for the given base URL and optional bearer token.
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        debug!(model = %request.model, messages = request.messages.len(), "chat completion request");

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireResponse = response.json().await?;
        let text = wire
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                ProviderError::InvalidResponse("response carried no message content".to_owned())
            })?;

        Ok(CompletionResponse {
            text,
            model: wire.model.unwrap_or(request.model),
        })
    }
}
