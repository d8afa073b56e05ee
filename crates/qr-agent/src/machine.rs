//! The research conversation state machine.
//!
//! A turn starts in [`Node::Chat`]. The chat step asks the model what to do;
//! `Search` and `DeleteResources` move to their nodes, which return to chat,
//! report and question writes re-enter chat directly, and a reply without a
//! recognised tool call ends the turn.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use qr_core::{
    CompletionRequest, CompletionResponse, Error, Message, Resource, ResourceCache, SearchProvider,
};
use qr_providers::{ModelRegistry, RegisteredModel};
use qr_tools::ResourceFetcher;

use crate::error::AgentError;
use crate::prompt;
use crate::state::{AgentState, LogEntry};
use crate::tools::{self, ResearchTool};

/// Tuning for a [`ResearchAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Returns to the chat node allowed within one turn.
    pub max_reentries: usize,
    /// Upper bound on a single model call.
    pub model_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_reentries: 10,
            model_timeout: Duration::from_secs(120),
        }
    }
}

impl AgentConfig {
    pub fn with_max_reentries(mut self, max: usize) -> Self {
        self.max_reentries = max;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }
}

/// Where the machine is. Search and delete carry the arguments of the tool
/// call that led there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Chat,
    Search { queries: Vec<String> },
    Delete { urls: Vec<String> },
    Terminated,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::Chat => "chat",
            Node::Search { .. } => "search",
            Node::Delete { .. } => "delete",
            Node::Terminated => "terminated",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress notifications emitted while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    NodeEntered { node: String },
    AssistantMessage { content: String },
    ReportUpdated { report: String },
    ResearchQuestionUpdated { research_question: String },
    ResourcesAdded { resources: Vec<Resource> },
    ResourcesRemoved { urls: Vec<String> },
    Log { message: String, done: bool },
    Finished { reply: String },
}

pub type EventSender = UnboundedSender<TurnEvent>;

/// Summary of a completed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Text of the final assistant message.
    pub reply: String,
    pub model_calls: usize,
    pub reentries: usize,
}

pub struct ResearchAgent {
    models: Arc<ModelRegistry>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<ResourceFetcher>,
    config: AgentConfig,
}

impl ResearchAgent {
    pub fn new(
        models: Arc<ModelRegistry>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<ResourceFetcher>,
        config: AgentConfig,
    ) -> Self {
        Self {
            models,
            search,
            fetcher,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        self.fetcher.cache()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn search_provider(&self) -> &Arc<dyn SearchProvider> {
        &self.search
    }

    pub fn fetcher(&self) -> &Arc<ResourceFetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one user turn to completion.
    ///
    /// On error `state` is left exactly as it was, so the turn can be retried.
    pub async fn run_turn(
        &self,
        state: &mut AgentState,
        user_message: &str,
    ) -> Result<TurnOutcome, AgentError> {
        self.run_turn_with_events(state, user_message, None, None).await
    }

    /// Run one user turn, reporting progress on `events`. A `model` switches
    /// the session's model as part of the turn, so it is kept only on success.
    pub async fn run_turn_with_events(
        &self,
        state: &mut AgentState,
        user_message: &str,
        model: Option<&str>,
        events: Option<&EventSender>,
    ) -> Result<TurnOutcome, AgentError> {
        let mut working = state.clone();
        if let Some(model) = model {
            working.model = model.to_string();
        }
        working.absorb_resource_content(self.cache());
        working.messages.push(Message::user(user_message));

        info!(
            model = %working.model,
            messages = working.messages.len(),
            resources = working.resources.len(),
            "Turn starting"
        );

        let mut node = Node::Chat;
        let mut model_calls = 0;
        let mut reentries = 0;

        while node != Node::Terminated {
            if node == Node::Chat {
                if model_calls > 0 {
                    reentries += 1;
                    if reentries > self.config.max_reentries {
                        error!(limit = self.config.max_reentries, "Turn exceeded chat re-entry limit");
                        return Err(AgentError::LoopLimitExceeded {
                            limit: self.config.max_reentries,
                        });
                    }
                }
                model_calls += 1;
            }

            emit(
                events,
                TurnEvent::NodeEntered {
                    node: node.name().to_string(),
                },
            );
            node = self.step(node, &mut working, events).await?;
        }

        let reply = working.last_reply().unwrap_or_default();
        emit(events, TurnEvent::Finished { reply: reply.clone() });
        info!(model_calls, reentries, "Turn finished");

        *state = working;
        Ok(TurnOutcome {
            reply,
            model_calls,
            reentries,
        })
    }

    /// Execute a single node and return the next one.
    pub async fn step(
        &self,
        node: Node,
        state: &mut AgentState,
        events: Option<&EventSender>,
    ) -> Result<Node, AgentError> {
        debug!(node = %node, "Entering node");
        match node {
            Node::Chat => self.chat(state, events).await,
            Node::Search { queries } => self.search(state, &queries, events).await,
            Node::Delete { urls } => Ok(self.delete(state, &urls, events)),
            Node::Terminated => Ok(Node::Terminated),
        }
    }

    async fn chat(
        &self,
        state: &mut AgentState,
        events: Option<&EventSender>,
    ) -> Result<Node, AgentError> {
        let hydrated = state.hydrate(self.cache());
        let model = self.resolve_model(&state.model)?;

        let mut messages = vec![Message::system(prompt::chat_system_prompt(
            &state.research_question,
            &state.report,
            &hydrated,
        ))];
        messages.extend(prompt::model_history(&state.messages));

        let request = model.prepare(CompletionRequest::new(messages).with_tools(tools::definitions()));
        let response = self.invoke(model, request).await?;
        let message = response.message;

        // Decode before touching the state so malformed calls leave it unchanged.
        let selected = ResearchTool::select(&message.tool_calls)?;

        let text = message.content.clone();
        state.messages.push(message);
        if !text.is_empty() {
            emit(events, TurnEvent::AssistantMessage { content: text });
        }

        let next = match selected {
            None => Node::Terminated,
            Some((_, ResearchTool::Search { queries })) => Node::Search { queries },
            Some((_, ResearchTool::DeleteResources { urls })) => Node::Delete { urls },
            Some((_, ResearchTool::WriteReport { report })) => {
                state.report = report;
                emit(
                    events,
                    TurnEvent::ReportUpdated {
                        report: state.report.clone(),
                    },
                );
                Node::Chat
            }
            Some((_, ResearchTool::WriteResearchQuestion { research_question })) => {
                state.research_question = research_question;
                emit(
                    events,
                    TurnEvent::ResearchQuestionUpdated {
                        research_question: state.research_question.clone(),
                    },
                );
                Node::Chat
            }
        };

        info!(next = %next, hydrated = hydrated.len(), "Chat step complete");
        Ok(next)
    }

    async fn search(
        &self,
        state: &mut AgentState,
        queries: &[String],
        events: Option<&EventSender>,
    ) -> Result<Node, AgentError> {
        state.logs.clear();

        let mut found = Vec::new();
        for query in queries {
            start_log(state, events, format!("Searching the web for '{}'", query));
            let results = self
                .search
                .search(query)
                .await
                .map_err(AgentError::Search)?;
            debug!(query = %query, results = results.len(), "Search results");
            finish_log(state, events);
            found.extend(results);
        }

        let added = state.add_resources(found);
        for resource in &added {
            start_log(state, events, format!("Downloading {}", resource.url));
            self.fetcher.fetch_if_missing(&resource.url).await;
            finish_log(state, events);
        }

        if !added.is_empty() {
            emit(events, TurnEvent::ResourcesAdded { resources: added.clone() });
        }
        info!(
            queries = queries.len(),
            added = added.len(),
            total = state.resources.len(),
            "Search step complete"
        );
        Ok(Node::Chat)
    }

    fn delete(&self, state: &mut AgentState, urls: &[String], events: Option<&EventSender>) -> Node {
        let removed = state.remove_resources(urls);
        info!(requested = urls.len(), removed = removed.len(), "Delete step complete");
        if !removed.is_empty() {
            emit(events, TurnEvent::ResourcesRemoved { urls: removed });
        }
        Node::Chat
    }

    pub(crate) fn resolve_model(&self, name: &str) -> Result<&RegisteredModel, AgentError> {
        self.models
            .resolve(Some(name))
            .map_err(AgentError::ModelInvocation)
    }

    pub(crate) async fn invoke(
        &self,
        model: &RegisteredModel,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AgentError> {
        debug!(
            model = %model.name,
            provider = %model.provider.name(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Invoking model"
        );

        match tokio::time::timeout(self.config.model_timeout, model.provider.complete(request)).await
        {
            Ok(Ok(response)) => {
                debug!(
                    finish_reason = ?response.finish_reason,
                    tool_calls = response.message.tool_calls.len(),
                    total_tokens = response.usage.total_tokens,
                    "Model replied"
                );
                Ok(response)
            }
            Ok(Err(e)) => {
                error!(model = %model.name, error = %e, "Model call failed");
                Err(AgentError::ModelInvocation(e))
            }
            Err(_) => {
                error!(model = %model.name, timeout = ?self.config.model_timeout, "Model call timed out");
                Err(AgentError::ModelInvocation(Error::timeout(format!(
                    "model '{}' did not respond within {:?}",
                    model.name, self.config.model_timeout
                ))))
            }
        }
    }
}

fn emit(events: Option<&EventSender>, event: TurnEvent) {
    if let Some(tx) = events {
        // A dropped receiver only means nobody is listening.
        let _ = tx.send(event);
    }
}

fn start_log(state: &mut AgentState, events: Option<&EventSender>, message: String) {
    state.logs.push(LogEntry {
        message: message.clone(),
        done: false,
    });
    emit(events, TurnEvent::Log { message, done: false });
}

fn finish_log(state: &mut AgentState, events: Option<&EventSender>) {
    if let Some(entry) = state.logs.last_mut() {
        entry.done = true;
        emit(
            events,
            TurnEvent::Log {
                message: entry.message.clone(),
                done: true,
            },
        );
    }
}
