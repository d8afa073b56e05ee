//! qr-tools: External collaborators for the research agent
//!
//! - Web: fetch pages and convert them to text, recording every outcome in
//!   the shared resource cache
//! - Search: web search through the Tavily API

pub mod search;
pub mod web;

pub use search::{TavilyConfig, TavilySearch};
pub use web::{html_to_text, FetchConfig, ResourceFetcher};
