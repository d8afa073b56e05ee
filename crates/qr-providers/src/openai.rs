//! OpenAI chat-completions backend. Also serves any OpenAI-compatible
//! server (vLLM, Ollama, LM Studio) through `with_base_url`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use qr_core::{
    CompletionRequest, CompletionResponse, Error, FinishReason, Message, Provider, ToolCall,
    Usage,
};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http::client(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn encode(&self, request: &CompletionRequest) -> ChatBody {
        ChatBody {
            // Compatible servers often have a model baked in; omit when unset
            model: request.model.clone().or_else(|| self.default_model.clone()),
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request
                .tools
                .iter()
                .map(|tool| FunctionTool {
                    kind: FUNCTION,
                    function: FunctionSpec {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: http::schema_of(tool),
                    },
                })
                .collect(),
        }
    }
}

const FUNCTION: &str = "function";

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        let text = message.content.clone();
        Self {
            role: message.role.as_str().to_string(),
            // An assistant turn made only of tool calls carries null content
            content: if text.is_empty() && message.has_tool_calls() {
                None
            } else {
                Some(text)
            },
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireCall {
                    id: call.id.clone(),
                    kind: FUNCTION.to_string(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

fn decode(reply: ChatReply) -> Result<CompletionResponse, Error> {
    let Some(choice) = reply.choices.into_iter().next() else {
        return Err(Error::api(500, "Response contained no choices"));
    };

    // Arguments arrive as a JSON string. Text that doesn't parse is kept as a
    // string so the agent can reject it as malformed.
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::String(call.function.arguments));
            ToolCall::new(call.id, call.function.name, arguments)
        })
        .collect();

    let texts = choice.message.content.into_iter().collect();

    Ok(CompletionResponse {
        message: http::assistant_reply(texts, tool_calls),
        usage: reply
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default(),
        model: reply.model,
        finish_reason: match choice.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        },
    })
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let body = self.encode(&request);
        debug!(
            model = ?body.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "OpenAI request"
        );

        let builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);
        let reply: ChatReply = http::post_json("openai", builder, &body).await?;
        let response = decode(reply)?;

        debug!(
            model = %response.model,
            finish_reason = ?response.finish_reason,
            tool_calls = response.message.tool_calls.len(),
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "OpenAI response"
        );
        Ok(response)
    }
}

// Wire format

#[derive(Debug, Serialize)]
struct ChatBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<FunctionTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_empty")]
    tool_calls: Vec<WireCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// Some compatible servers send `"tool_calls": null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<WireCall>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<WireCall>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    FUNCTION.to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct FunctionTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec,
}

#[derive(Debug, Serialize)]
struct FunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenCounts>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenCounts {
    prompt_tokens: u32,
    completion_tokens: u32,
}
