//! LLM provider abstraction layer.
//!
//! Defines the [`LlmProvider`] trait and the shared request/response types.
//! One concrete provider is implemented, [`openai::OpenAiProvider`], which
//! speaks any OpenAI-compatible chat-completions endpoint. The
//! [`router::ModelRouter`] applies per-agent sampling defaults and
//! model-name temperature constraints before each call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;
pub mod router;

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// Human user message.
    User,
    /// Assistant (LLM) message.
    Assistant,
}

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// Plain text content.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: &str) -> Self {
        Self {
            role: Role::System,
            content: content.to_owned(),
        }
    }

    /// A user message.
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_owned(),
        }
    }
}

/// A request to an LLM provider for a completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier sent to the endpoint.
    pub model: String,
    /// Conversation including the latest user message.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature; provider default when `None`.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response.
    pub max_tokens: Option<u32>,
}

/// The response from an LLM provider.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Response text.
    pub text: String,
    /// The model identifier that served this response.
    pub model: String,
}

/// Errors returned by model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The endpoint returned a non-success status.
    #[error("provider returned status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },
    /// Response did not match the expected schema.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// An LLM backend capable of serving chat completions.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Run one completion.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;
}
