//! Prompt assembly for the chat and analyze steps.

use std::collections::HashSet;

use serde::Serialize;

use qr_core::{Message, Resource, Role};

use crate::tools::{self, ResearchTool};

/// Characters of each resource shown to the analyze step.
pub const ANALYZE_CONTENT_CHARS: usize = 1000;

const CHAT_INSTRUCTIONS: &str = "You are a research assistant. Help the user with writing a research report.
Use the resources to answer questions but don't just recite them.
Use the search tool to find resources when needed.
Use WriteReport to save the report - never just respond with it.
If there's a research question, don't ask for it again.";

pub const ANALYZE_INSTRUCTIONS: &str =
    "You are a research assistant. Analyze the resources and help improve the research report.";

/// System prompt for the chat step, embedding the current research context.
pub fn chat_system_prompt(research_question: &str, report: &str, hydrated: &[Resource]) -> String {
    let resources = serde_json::to_string(hydrated).unwrap_or_else(|_| "[]".to_string());
    format!(
        "{}\n\nResearch question: {}\nCurrent report: {}\nResources: {}",
        CHAT_INSTRUCTIONS, research_question, report, resources
    )
}

#[derive(Serialize)]
struct AnalyzedResource<'a> {
    url: &'a str,
    title: &'a str,
    content: String,
}

/// User message for the analyze step. `contents` pairs each resource with its
/// cached text, if any.
pub fn analyze_user_prompt(
    research_question: &str,
    report: &str,
    contents: &[(&Resource, Option<String>)],
) -> String {
    let listed: Vec<AnalyzedResource<'_>> = contents
        .iter()
        .map(|(resource, content)| AnalyzedResource {
            url: &resource.url,
            title: &resource.title,
            content: match content {
                Some(text) if !text.is_empty() => excerpt(text, ANALYZE_CONTENT_CHARS),
                _ => "No content".to_string(),
            },
        })
        .collect();
    let resources = serde_json::to_string_pretty(&listed).unwrap_or_else(|_| "[]".to_string());

    format!(
        "Research Question: {}\nCurrent Report: {}\n\nResources:\n{}\n\nPlease analyze these resources and suggest improvements to the report.",
        research_question, report, resources
    )
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Conversation history as sent to the model.
///
/// Assistant tool calls in the stored history never have results attached,
/// so a result is synthesised after each one describing how it was handled.
pub fn model_history(messages: &[Message]) -> Vec<Message> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let mut history = Vec::with_capacity(messages.len());
    for message in messages {
        history.push(message.clone());
        if message.role != Role::Assistant || !message.has_tool_calls() {
            continue;
        }

        let acted_on = message
            .tool_calls
            .iter()
            .position(|c| tools::is_known(&c.name));

        for (i, call) in message.tool_calls.iter().enumerate() {
            if answered.contains(call.id.as_str()) {
                continue;
            }
            let outcome = if Some(i) == acted_on {
                match ResearchTool::decode(call) {
                    Ok(Some(tool)) => completed_result(&tool),
                    _ => "Tool call could not be processed.".to_string(),
                }
            } else if tools::is_known(&call.name) {
                "Ignored: only one tool call is processed per reply.".to_string()
            } else {
                format!("Ignored: unknown tool '{}'.", call.name)
            };
            history.push(Message::tool_result(&call.id, outcome));
        }
    }
    history
}

fn completed_result(tool: &ResearchTool) -> String {
    match tool {
        ResearchTool::Search { queries } => format!(
            "Searched for {}; new results were added to the resources.",
            queries.join(", ")
        ),
        ResearchTool::WriteReport { .. } => "Report saved.".to_string(),
        ResearchTool::WriteResearchQuestion { .. } => "Research question saved.".to_string(),
        ResearchTool::DeleteResources { urls } => {
            format!("Deleted {} resource(s) from the list.", urls.len())
        }
    }
}
