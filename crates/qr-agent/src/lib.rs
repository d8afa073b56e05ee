//! qr-agent: The research assistant's conversation engine
//!
//! - Tool vocabulary offered to the model
//! - Per-session [`AgentState`]
//! - The chat, search and delete state machine driving each user turn
//! - The one-shot analyze pass over the collected resources

mod analyze;
pub mod error;
pub mod machine;
pub mod prompt;
pub mod state;
pub mod tools;

pub use error::AgentError;
pub use machine::{AgentConfig, EventSender, Node, ResearchAgent, TurnEvent, TurnOutcome};
pub use state::{AgentState, LogEntry, DEFAULT_MODEL};
pub use tools::ResearchTool;
