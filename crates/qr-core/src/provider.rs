//! The language-model seam: one request in, one assistant reply out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{Message, Usage};
use crate::tool::ToolDefinition;

/// Everything a backend needs for one completion. System instructions travel
/// as [`Role::System`](crate::Role::System) messages at the head of `messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Backend model id; the provider's default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output cap. Backends that require one fill in their own default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The assistant's reply, including any tool calls it requested.
    pub message: Message,
    pub usage: Usage,
    /// Model id the backend reports having used.
    pub model: String,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Plain assistant reply with no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self::from_message(Message::assistant(content))
    }

    pub fn from_message(message: Message) -> Self {
        let finish_reason = if message.has_tool_calls() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        Self {
            message,
            usage: Usage::default(),
            model: String::new(),
            finish_reason,
        }
    }
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// A language-model backend: system prompt, tools and history in, one reply
/// out. Implementations do not stream and do not retry.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend family, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Model used when a request names none. `None` leaves the choice to the
    /// remote API.
    fn default_model(&self) -> Option<&str>;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error>;
}
