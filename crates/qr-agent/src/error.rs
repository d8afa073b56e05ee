use thiserror::Error;

/// Failures that end a turn. The session state is left as it was before the turn.
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// The model call failed, timed out, or named an unknown model.
    #[error("Model invocation failed: {0}")]
    ModelInvocation(qr_core::Error),

    #[error("Malformed arguments for tool '{tool}': {message}")]
    MalformedToolArguments { tool: String, message: String },

    #[error("Search failed: {0}")]
    Search(qr_core::Error),

    #[error("Loop limit exceeded: more than {limit} chat re-entries in one turn")]
    LoopLimitExceeded { limit: usize },
}

impl AgentError {
    pub fn malformed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedToolArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// True when the failure came from an upstream service rather than the agent itself.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::ModelInvocation(_) | Self::Search(_))
    }
}
