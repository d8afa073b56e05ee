//! Anthropic messages API backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use qr_core::{
    CompletionRequest, CompletionResponse, Error, FinishReason, Message, Provider, Role, ToolCall,
    Usage,
};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
/// The API requires an output cap on every request.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl AnthropicProvider {
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

    fn encode(&self, request: &CompletionRequest) -> MessagesBody {
        let (system, history): (Vec<&Message>, Vec<&Message>) = request
            .messages
            .iter()
            .partition(|m| m.role == Role::System);

        let system: Vec<String> = system
            .into_iter()
            .map(|m| m.content.clone())
            .filter(|text| !text.is_empty())
            .collect();

        let turns: Vec<Turn> = history.into_iter().map(to_turn).collect();

        MessagesBody {
            model: request.model.clone().or_else(|| self.default_model.clone()),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: http::coalesce(turns, |a, b| a.role == b.role, |t| &mut t.content),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            tools: request
                .tools
                .iter()
                .map(|tool| ToolSpec {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: http::schema_of(tool),
                })
                .collect(),
        }
    }
}

/// Convert one non-system message. Tool results travel as user turns
/// holding `tool_result` blocks.
fn to_turn(message: &Message) -> Turn {
    let text = message.content.clone();
    let mut content = Vec::new();

    match message.role {
        Role::Tool => content.push(Block::ToolResult {
            tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
            content: text,
        }),
        _ => {
            if !text.is_empty() {
                content.push(Block::Text { text });
            }
            content.extend(message.tool_calls.iter().map(|call| Block::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            }));
        }
    }

    Turn {
        role: if message.role == Role::Assistant {
            "assistant"
        } else {
            "user"
        },
        content,
    }
}

fn decode(reply: MessagesReply) -> CompletionResponse {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in reply.content {
        match block {
            Block::Text { text } => texts.push(text),
            Block::ToolUse { id, name, input } => tool_calls.push(ToolCall::new(id, name, input)),
            Block::ToolResult { .. } | Block::Unsupported => {}
        }
    }

    CompletionResponse {
        message: http::assistant_reply(texts, tool_calls),
        usage: Usage::new(reply.usage.input_tokens, reply.usage.output_tokens),
        model: reply.model,
        finish_reason: match reply.stop_reason.as_deref() {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            Some("refusal") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        },
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let body = self.encode(&request);
        debug!(
            model = ?body.model,
            turns = body.messages.len(),
            tools = body.tools.len(),
            "Anthropic request"
        );

        let builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION);
        let reply: MessagesReply = http::post_json("anthropic", builder, &body).await?;
        let response = decode(reply);

        debug!(
            model = %response.model,
            finish_reason = ?response.finish_reason,
            tool_calls = response.message.tool_calls.len(),
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "Anthropic response"
        );
        Ok(response)
    }
}

// Wire format

#[derive(Debug, Serialize)]
struct MessagesBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Turn>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
}

#[derive(Debug, Serialize)]
struct Turn {
    role: &'static str,
    content: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Thinking and other block kinds this client never sends.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize)]
struct ToolSpec {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    #[serde(default)]
    model: String,
    content: Vec<Block>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: TokenCounts,
}

#[derive(Debug, Deserialize)]
struct TokenCounts {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_system_messages_move_to_system_field() {
        let provider = AnthropicProvider::new("test-key");
        let body = provider.encode(&CompletionRequest::new(vec![
            Message::system("You are a research assistant."),
            Message::user("Hello"),
        ]));

        assert_eq!(body.system.as_deref(), Some("You are a research assistant."));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_tool_result_merges_with_next_user_turn() {
        let provider = AnthropicProvider::new("test-key");
        let body = provider.encode(&CompletionRequest::new(vec![
            Message::user("Write it up"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("tc_1", "WriteReport", json!({"report": "r"}))],
            ),
            Message::tool_result("tc_1", "Report saved."),
            Message::user("Thanks"),
        ]));

        assert_eq!(body.messages.len(), 3);
        assert_eq!(body.messages[1].role, "assistant");
        assert_eq!(body.messages[2].role, "user");
        assert_eq!(body.messages[2].content.len(), 2);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(json["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(json["messages"][2]["content"][0]["tool_use_id"], "tc_1");
    }

    #[test]
    fn test_decode_tool_use() {
        let reply: MessagesReply = serde_json::from_value(json!({
            "model": "claude-3-opus-20240229",
            "content": [
                {"type": "text", "text": "Let me search."},
                {"type": "tool_use", "id": "toolu_123", "name": "Search", "input": {"queries": ["rust"]}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 15}
        }))
        .unwrap();

        let parsed = decode(reply);
        assert_eq!(parsed.message.tool_calls.len(), 1);
        assert_eq!(parsed.message.tool_calls[0].name, "Search");
        assert_eq!(parsed.message.content, "Let me search.");
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.usage.total_tokens, 35);
    }

    #[tokio::test]
    async fn test_complete_sends_version_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-opus-20240229",
                "content": [{"type": "text", "text": "Here is what I found."}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 5, "output_tokens": 6}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("test-key").with_base_url(server.uri());
        let response = provider
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(response.message.content, "Here is what I found.");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_complete_maps_overload_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("test-key").with_base_url(server.uri());
        let err = provider
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api { status: 529, .. }));
    }
}
