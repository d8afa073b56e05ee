//! The tool vocabulary offered to the model.

use serde::Deserialize;
use tracing::warn;

use qr_core::{Schema, ToolCall, ToolDefinition};

use crate::error::AgentError;

pub const SEARCH: &str = "Search";
pub const WRITE_REPORT: &str = "WriteReport";
pub const WRITE_RESEARCH_QUESTION: &str = "WriteResearchQuestion";
pub const DELETE_RESOURCES: &str = "DeleteResources";

/// A recognised tool invocation with decoded arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResearchTool {
    Search { queries: Vec<String> },
    WriteReport { report: String },
    WriteResearchQuestion { research_question: String },
    DeleteResources { urls: Vec<String> },
}

#[derive(Deserialize)]
struct SearchArgs {
    queries: Vec<String>,
}

#[derive(Deserialize)]
struct WriteReportArgs {
    report: String,
}

#[derive(Deserialize)]
struct WriteResearchQuestionArgs {
    research_question: String,
}

#[derive(Deserialize)]
struct DeleteResourcesArgs {
    urls: Vec<String>,
}

impl ResearchTool {
    pub fn name(&self) -> &'static str {
        match self {
            ResearchTool::Search { .. } => SEARCH,
            ResearchTool::WriteReport { .. } => WRITE_REPORT,
            ResearchTool::WriteResearchQuestion { .. } => WRITE_RESEARCH_QUESTION,
            ResearchTool::DeleteResources { .. } => DELETE_RESOURCES,
        }
    }

    /// Decode a tool call. `Ok(None)` means the name is not part of the vocabulary.
    pub fn decode(call: &ToolCall) -> Result<Option<Self>, AgentError> {
        fn args<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, AgentError> {
            serde_json::from_value(call.arguments.clone())
                .map_err(|e| AgentError::malformed(&call.name, e.to_string()))
        }

        let tool = match call.name.as_str() {
            SEARCH => {
                let a: SearchArgs = args(call)?;
                ResearchTool::Search { queries: a.queries }
            }
            WRITE_REPORT => {
                let a: WriteReportArgs = args(call)?;
                ResearchTool::WriteReport { report: a.report }
            }
            WRITE_RESEARCH_QUESTION => {
                let a: WriteResearchQuestionArgs = args(call)?;
                ResearchTool::WriteResearchQuestion {
                    research_question: a.research_question,
                }
            }
            DELETE_RESOURCES => {
                let a: DeleteResourcesArgs = args(call)?;
                ResearchTool::DeleteResources { urls: a.urls }
            }
            _ => return Ok(None),
        };
        Ok(Some(tool))
    }

    /// Pick the call to act on: the first one with a recognised name.
    ///
    /// Unknown names are logged and skipped; recognised calls after the chosen
    /// one are logged and left unprocessed.
    pub fn select(calls: &[ToolCall]) -> Result<Option<(usize, Self)>, AgentError> {
        let Some(index) = calls.iter().position(|c| is_known(&c.name)) else {
            for call in calls {
                warn!(tool = %call.name, "Ignoring unknown tool call");
            }
            return Ok(None);
        };

        for (i, call) in calls.iter().enumerate() {
            if i == index {
                continue;
            }
            if is_known(&call.name) {
                warn!(tool = %call.name, "Ignoring extra tool call; one call is processed per reply");
            } else {
                warn!(tool = %call.name, "Ignoring unknown tool call");
            }
        }

        let tool = Self::decode(&calls[index])?;
        Ok(tool.map(|t| (index, t)))
    }
}

pub fn is_known(name: &str) -> bool {
    matches!(
        name,
        SEARCH | WRITE_REPORT | WRITE_RESEARCH_QUESTION | DELETE_RESOURCES
    )
}

/// Schemas for the four research tools.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            SEARCH,
            "A list of one or more search queries to find good resources to support the research.",
        )
        .required("queries", Schema::string_array("One or more search queries")),
        ToolDefinition::new(WRITE_REPORT, "Write the research report.").required(
            "report",
            Schema::string("Full text of the report, replacing the current one"),
        ),
        ToolDefinition::new(WRITE_RESEARCH_QUESTION, "Write the research question.")
            .required("research_question", Schema::string("The research question")),
        ToolDefinition::new(DELETE_RESOURCES, "Delete the URLs from the resources.")
            .required("urls", Schema::string_array("URLs of the resources to delete")),
    ]
}
