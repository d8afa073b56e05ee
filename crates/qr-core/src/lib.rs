//! Shared vocabulary of the research assistant: conversation messages, tool
//! schemas, the model and search backend traits, and the resource cache.

pub mod cache;
pub mod error;
pub mod message;
pub mod provider;
pub mod resource;
pub mod search;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CachedResource, ResourceCache, ERROR_MARKER_PREFIX, LEGACY_ERROR_MARKER};
pub use error::Error;
pub use message::{Message, Role, ToolCall, Usage};
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider};
pub use resource::Resource;
pub use search::SearchProvider;
pub use tool::{ObjectSchema, Schema, ToolDefinition};

pub type Result<T> = std::result::Result<T, Error>;
