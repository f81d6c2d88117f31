//! Completion provider trait: the abstraction over the language model.
//!
//! A provider receives the composed system prompt, the recent conversation
//! history and the current user text, and returns the model's raw reply.
//! The reply may contain directives; interpreting them is the agent's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Message;

/// A single completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The composed system prompt (knowledge blocks for this turn)
    pub system_prompt: String,

    /// Recent conversation history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Message>,

    /// The user text this turn answers
    pub user_text: String,

    /// The model to use (e.g., "gpt-4o-mini"); `None` leaves it to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(system_prompt: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            user_text: user_text.into(),
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the model and its sampling settings.
    pub fn with_model(mut self, model: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        self.model = Some(model.into());
        self.temperature = Some(temperature);
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The generated text, directives included
    pub text: String,

    /// Which model actually responded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Token usage statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            usage: None,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The completion collaborator.
///
/// Hosts wrap their model client in this trait; the orchestration loop
/// calls `complete()` without knowing which backend answers. Errors must
/// not escape a conversation turn: the agent turns them into an apology.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// A human-readable name for this provider.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError>;
}
