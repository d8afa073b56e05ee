//! Scripted model and search backends for tests across the workspace.
//! Compiled for tests and with the `testing` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::{Message, ToolCall};
use crate::provider::{CompletionRequest, CompletionResponse, Provider};
use crate::resource::Resource;
use crate::search::SearchProvider;

/// Replays queued replies in FIFO order and records every request.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<CompletionResponse, Error>>>,
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, reply: Result<CompletionResponse, Error>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn queue_response(&self, content: &str) {
        self.push(Ok(CompletionResponse::text(content)));
    }

    /// Queue a reply invoking one tool. Call ids are `call_<n>` by queue position.
    pub fn queue_tool_call(&self, name: &str, arguments: serde_json::Value) {
        let id = format!("call_{}", self.script.lock().unwrap().len());
        self.queue_tool_calls(vec![ToolCall::new(id, name, arguments)]);
    }

    pub fn queue_tool_calls(&self, tool_calls: Vec<ToolCall>) {
        let message = Message::assistant_with_tool_calls("", tool_calls);
        self.push(Ok(CompletionResponse::from_message(message)));
    }

    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.push(Ok(response));
    }

    pub fn queue_error(&self, error: Error) {
        self.push(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::api(500, "mock provider has no reply queued")))
    }
}

/// Canned results keyed by query. Unknown queries find nothing.
#[derive(Default)]
pub struct MockSearch {
    canned: Mutex<HashMap<String, Result<Vec<Resource>, Error>>>,
    pub queries: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_results(&self, query: &str, results: Vec<Resource>) {
        self.canned.lock().unwrap().insert(query.to_string(), Ok(results));
    }

    pub fn fail_query(&self, query: &str, error: Error) {
        self.canned.lock().unwrap().insert(query.to_string(), Err(error));
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl SearchProvider for MockSearch {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(&self, query: &str) -> Result<Vec<Resource>, Error> {
        self.queries.lock().unwrap().push(query.to_string());
        match self.canned.lock().unwrap().get(query) {
            Some(outcome) => outcome.clone(),
            None => Ok(Vec::new()),
        }
    }
}
