//! Language-model backends (OpenAI-compatible, Anthropic, Gemini) and the
//! named registry the research agent picks models from.

pub mod anthropic;
pub mod gemini;
mod http;
pub mod openai;
pub mod registry;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
pub use registry::{Backend, ModelRegistry, ModelSettings, RegisteredModel};
