//! One-shot report revision over the current resources.

use tracing::info;

use qr_core::{CompletionRequest, Message};

use crate::error::AgentError;
use crate::machine::ResearchAgent;
use crate::prompt;
use crate::state::AgentState;

impl ResearchAgent {
    /// Download any resources not yet in the cache, then ask the model for a
    /// revised report and store its reply as the new report.
    ///
    /// Like a turn, a failure leaves `state` unchanged.
    pub async fn analyze(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let mut working = state.clone();
        working.absorb_resource_content(self.cache());

        let mut contents = Vec::with_capacity(working.resources.len());
        for resource in &working.resources {
            let entry = self.fetcher().fetch_if_missing(&resource.url).await;
            contents.push((resource, entry.content().map(str::to_string)));
        }

        let user_prompt =
            prompt::analyze_user_prompt(&working.research_question, &working.report, &contents);
        drop(contents);

        let model = self.resolve_model(&working.model)?;
        let request = model.prepare(CompletionRequest::new(vec![
            Message::system(prompt::ANALYZE_INSTRUCTIONS),
            Message::user(user_prompt),
        ]));
        let response = self.invoke(model, request).await?;

        working.report = response.message.content.clone();
        info!(
            resources = working.resources.len(),
            report_len = working.report.len(),
            "Analysis complete"
        );

        *state = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use qr_core::testing::{MockProvider, MockSearch};
    use qr_core::{CachedResource, Error, Resource, ResourceCache};
    use qr_providers::ModelRegistry;
    use qr_tools::{FetchConfig, ResourceFetcher};

    use super::*;
    use crate::machine::AgentConfig;

    fn agent_with(provider: Arc<MockProvider>) -> ResearchAgent {
        let fetcher = Arc::new(ResourceFetcher::new(
            Arc::new(ResourceCache::new()),
            FetchConfig {
                timeout: Duration::from_secs(2),
                ..FetchConfig::default()
            },
        ));
        let models = ModelRegistry::new("openai").with_model("openai", provider, None, None);
        ResearchAgent::new(
            Arc::new(models),
            Arc::new(MockSearch::new()),
            fetcher,
            AgentConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_analyze_replaces_report() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_response("Improved report.");
        let agent = agent_with(provider.clone());
        agent
            .cache()
            .put("http://a", CachedResource::Fetched("a".repeat(1500)));
        agent
            .cache()
            .put("http://b", CachedResource::Failed("404".into()));

        let mut state = AgentState::new();
        state.research_question = "Is solar cheap?".to_string();
        state.report = "Old report.".to_string();
        state.add_resources(vec![
            Resource::new("http://a", "A", ""),
            Resource::new("http://b", "B", ""),
        ]);

        agent.analyze(&mut state).await.unwrap();

        assert_eq!(state.report, "Improved report.");
        assert!(state.messages.is_empty());

        let request = provider.last_request().unwrap();
        assert!(request.tools.is_empty());
        let user = request.messages[1].content.clone();
        assert!(user.contains("Research Question: Is solar cheap?"));
        assert!(user.contains("Current Report: Old report."));
        assert!(user.contains(&format!("{}...", "a".repeat(1000))));
        assert!(user.contains("No content"));
    }

    #[tokio::test]
    async fn test_analyze_failure_keeps_report() {
        let provider = Arc::new(MockProvider::new());
        provider.queue_error(Error::auth("bad key"));
        let agent = agent_with(provider);

        let mut state = AgentState::new();
        state.report = "Keep me.".to_string();

        let err = agent.analyze(&mut state).await.unwrap_err();
        assert!(matches!(err, AgentError::ModelInvocation(Error::Auth(_))));
        assert_eq!(state.report, "Keep me.");
    }
}
