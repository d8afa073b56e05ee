//! Google Gemini `generateContent` backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use qr_core::{
    CompletionRequest, CompletionResponse, Error, FinishReason, Provider, Role, ToolCall,
    ToolDefinition, Usage,
};

use crate::http;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const FALLBACK_MODEL: &str = "gemini-pro";
const MODEL_ROLE: &str = "model";
const USER_ROLE: &str = "user";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
}

impl GeminiProvider {
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

    /// The model is part of the URL, so one is always needed.
    fn model_for(&self, request: &CompletionRequest) -> String {
        request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string())
    }
}

fn encode(request: &CompletionRequest) -> GenerateBody {
    let mut instruction = Vec::new();
    let mut contents = Vec::new();
    // Calls made by the most recent model turn; results answer these
    let mut open_calls: &[ToolCall] = &[];

    for message in &request.messages {
        let text = message.content.clone();
        match message.role {
            Role::System => {
                if !text.is_empty() {
                    instruction.push(Part::Text { text });
                }
            }
            Role::User => contents.push(Content::new(USER_ROLE, text_parts(text))),
            Role::Assistant => {
                open_calls = &message.tool_calls;
                let mut parts = text_parts(text);
                parts.extend(message.tool_calls.iter().map(|call| Part::FunctionCall {
                    function_call: FunctionCall {
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    },
                }));
                contents.push(Content::new(MODEL_ROLE, parts));
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                let part = Part::FunctionResponse {
                    function_response: FunctionResponse {
                        name: function_name_for(open_calls, call_id),
                        response: json!({ "result": text }),
                    },
                };
                contents.push(Content::new(USER_ROLE, vec![part]));
            }
        }
    }

    GenerateBody {
        contents: http::coalesce(contents, |a, b| a.role == b.role, |c| &mut c.parts),
        system_instruction: (!instruction.is_empty()).then(|| Content {
            role: None,
            parts: instruction,
        }),
        tools: if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolGroup {
                function_declarations: request.tools.iter().map(declaration).collect(),
            }]
        },
        generation_config: GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
        },
    }
}

fn text_parts(text: String) -> Vec<Part> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Part::Text { text }]
    }
}

/// Gemini pairs function responses with calls by name, not id. Ids are only
/// unique within one reply, so the lookup is limited to the preceding turn.
fn function_name_for(calls: &[ToolCall], call_id: &str) -> String {
    calls
        .iter()
        .find(|call| call.id == call_id)
        .map(|call| call.name.clone())
        .unwrap_or_else(|| format!("unknown_{}", call_id))
}

fn declaration(tool: &ToolDefinition) -> FunctionDeclaration {
    let mut parameters = http::schema_of(tool);
    // Rejected by the API
    if let Some(schema) = parameters.as_object_mut() {
        schema.remove("additionalProperties");
    }
    FunctionDeclaration {
        name: tool.name.clone(),
        description: tool.description.clone(),
        parameters,
    }
}

fn decode(reply: GenerateReply, model: &str) -> Result<CompletionResponse, Error> {
    let block_reason = reply.prompt_feedback.and_then(|f| f.block_reason);

    let Some(candidate) = reply.candidates.into_iter().next() else {
        return Err(match block_reason {
            Some(reason) => Error::api(400, format!("Blocked by safety filter: {}", reason)),
            None => Error::api(500, "Gemini returned no candidates"),
        });
    };

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        match part {
            Part::Text { text } => texts.push(text),
            Part::FunctionCall { function_call } => {
                // Gemini doesn't assign call ids; number them within the reply
                let id = format!("gemini_tc_{}", tool_calls.len());
                tool_calls.push(ToolCall::new(id, function_call.name, function_call.args));
            }
            Part::FunctionResponse { .. } => {}
        }
    }

    let finish_reason = match candidate.finish_reason.as_deref() {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    let usage = reply
        .usage_metadata
        .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
        .unwrap_or_default();

    Ok(CompletionResponse {
        message: http::assistant_reply(texts, tool_calls),
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let model = self.model_for(&request);
        let body = encode(&request);
        debug!(
            model = %model,
            contents = body.contents.len(),
            tools = request.tools.len(),
            "Gemini request"
        );

        let builder = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key);
        let reply: GenerateReply = http::post_json("gemini", builder, &body).await?;
        let response = decode(reply, &model)?;

        debug!(
            model = %response.model,
            finish_reason = ?response.finish_reason,
            tool_calls = response.message.tool_calls.len(),
            "Gemini response"
        );
        Ok(response)
    }
}

// Wire format

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

/// A part is distinguished by which key it carries, not by a tag.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReply {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use qr_core::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_model_fallback() {
        let provider = GeminiProvider::new("test-key");
        let request = CompletionRequest::new(vec![Message::user("Hello")]);
        assert_eq!(provider.model_for(&request), "gemini-pro");
        assert_eq!(
            provider.model_for(&request.clone().with_model("gemini-2.5-pro")),
            "gemini-2.5-pro"
        );
    }

    #[test]
    fn test_system_instruction_has_no_role() {
        let body = encode(&CompletionRequest::new(vec![
            Message::system("You are a research assistant."),
            Message::user("Hello"),
        ]));

        let json = serde_json::to_value(&body).unwrap();
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are a research assistant.");
        assert_eq!(json["contents"].as_array().unwrap().len(), 1);
        assert_eq!(json["contents"][0]["role"], "user");
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_declaration_drops_additional_properties() {
        let decl = declaration(&ToolDefinition::new("WriteReport", "Write the research report."));
        assert!(decl.parameters.get("additionalProperties").is_none());
        assert_eq!(decl.parameters["type"], "object");
    }

    #[test]
    fn test_function_response_uses_call_name() {
        let body = encode(&CompletionRequest::new(vec![
            Message::user("Delete it"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("gemini_tc_0", "DeleteResources", json!({"urls": ["http://a"]}))],
            ),
            Message::tool_result("gemini_tc_0", "Deleted."),
        ]));

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][1]["role"], "model");
        let last = &json["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(last["name"], "DeleteResources");
        assert_eq!(last["response"]["result"], "Deleted.");
    }

    #[test]
    fn test_function_response_names_follow_their_own_turn() {
        // Both replies number their calls from zero
        let body = encode(&CompletionRequest::new(vec![
            Message::user("Find and write"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("gemini_tc_0", "Search", json!({"queries": ["solar"]}))],
            ),
            Message::tool_result("gemini_tc_0", "Found 2 resources."),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("gemini_tc_0", "WriteReport", json!({"report": "r"}))],
            ),
            Message::tool_result("gemini_tc_0", "Report saved."),
        ]));

        let json = serde_json::to_value(&body).unwrap();
        let first = &json["contents"][2]["parts"][0]["functionResponse"];
        let second = &json["contents"][4]["parts"][0]["functionResponse"];
        assert_eq!(first["name"], "Search");
        assert_eq!(second["name"], "WriteReport");
        assert_eq!(second["response"]["result"], "Report saved.");
    }

    #[test]
    fn test_decode_function_call() {
        let reply: GenerateReply = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "Search", "args": {"queries": ["tides"]}}}]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2}
        }))
        .unwrap();

        let parsed = decode(reply, "gemini-pro").unwrap();
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.message.tool_calls[0].id, "gemini_tc_0");
        assert_eq!(parsed.usage.total_tokens, 9);
    }

    #[test]
    fn test_decode_blocked_prompt() {
        let reply: GenerateReply =
            serde_json::from_value(json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap();
        let err = decode(reply, "gemini-pro").unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_complete_posts_to_model_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Solar is getting cheaper."}]},
                    "finishReason": "STOP"
                }]
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new("test-key").with_base_url(server.uri());
        let response = provider
            .complete(CompletionRequest::new(vec![Message::user("Is solar cheap?")]))
            .await
            .unwrap();
        assert_eq!(response.message.content, "Solar is getting cheaper.");
        assert_eq!(response.model, "gemini-pro");
    }
}
