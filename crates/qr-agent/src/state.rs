//! Per-session conversation state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use qr_core::{CachedResource, Message, Resource, ResourceCache};

pub const DEFAULT_MODEL: &str = "openai";

/// Progress line shown to the user while a search step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(default)]
    pub done: bool,
}

/// Everything one research conversation knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub research_question: String,
    #[serde(default)]
    pub report: String,
    /// Unique by URL. Content lives in the resource cache.
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            research_question: String::new(),
            report: String::new(),
            resources: Vec::new(),
            logs: Vec::new(),
            model: default_model(),
        }
    }
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn has_resource(&self, url: &str) -> bool {
        self.resources.iter().any(|r| r.url == url)
    }

    /// Append resources whose URL is not present yet; earlier entries win.
    /// Returns the resources actually added.
    pub fn add_resources(&mut self, incoming: impl IntoIterator<Item = Resource>) -> Vec<Resource> {
        let mut seen: HashSet<String> = self.resources.iter().map(|r| r.url.clone()).collect();
        let mut added = Vec::new();
        for mut resource in incoming {
            if !seen.insert(resource.url.clone()) {
                continue;
            }
            resource.content = None;
            self.resources.push(resource.clone());
            added.push(resource);
        }
        added
    }

    /// Remove resources by URL. URLs that match nothing are ignored.
    /// Returns the URLs actually removed.
    pub fn remove_resources(&mut self, urls: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.resources.retain(|r| {
            if urls.contains(&r.url) {
                removed.push(r.url.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Move client-supplied resource content into the cache, leaving only
    /// metadata on the state. Duplicate URLs are dropped.
    pub fn absorb_resource_content(&mut self, cache: &ResourceCache) {
        let mut seen = HashSet::new();
        self.resources.retain(|r| seen.insert(r.url.clone()));
        for resource in &mut self.resources {
            if let Some(content) = resource.content.take() {
                cache.seed(&resource.url, &content);
            }
        }
    }

    /// Resources with their cached text, for prompting. Resources the cache
    /// has no usable text for are left out.
    pub fn hydrate(&self, cache: &ResourceCache) -> Vec<Resource> {
        self.resources
            .iter()
            .filter_map(|resource| match cache.get(&resource.url) {
                Some(CachedResource::Fetched(text)) => Some(resource.clone().with_content(text)),
                _ => None,
            })
            .collect()
    }

    /// Text of the most recent assistant message.
    pub fn last_reply(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == qr_core::Role::Assistant)
            .map(|m| m.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(url: &str, title: &str) -> Resource {
        Resource::new(url, title, "")
    }

    #[test]
    fn test_default_state() {
        let state = AgentState::new();
        assert!(state.messages.is_empty());
        assert!(state.report.is_empty());
        assert_eq!(state.model, "openai");
    }

    #[test]
    fn test_deserialize_partial_state() {
        let state: AgentState = serde_json::from_str(r#"{"report": "draft"}"#).unwrap();
        assert_eq!(state.report, "draft");
        assert_eq!(state.model, "openai");
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_add_resources_deduplicates() {
        let mut state = AgentState::new();
        state.add_resources(vec![res("http://a", "original")]);

        let added = state.add_resources(vec![
            res("http://a", "replacement"),
            res("http://b", "b"),
            res("http://b", "b again"),
        ]);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].url, "http://b");
        assert_eq!(state.resources.len(), 2);
        assert_eq!(state.resources[0].title, "original");
        assert_eq!(state.resources[1].title, "b");
    }

    #[test]
    fn test_remove_resources_leaves_others() {
        let mut state = AgentState::new();
        state.add_resources(vec![res("http://a", "a"), res("http://b", "b")]);

        let removed = state.remove_resources(&["http://a".to_string(), "http://zzz".to_string()]);

        assert_eq!(removed, vec!["http://a".to_string()]);
        assert_eq!(state.resources, vec![res("http://b", "b")]);
    }

    #[test]
    fn test_hydrate_skips_failed_and_missing() {
        let cache = ResourceCache::new();
        cache.put("http://ok", CachedResource::Fetched("text".into()));
        cache.put("http://bad", CachedResource::Failed("404".into()));

        let mut state = AgentState::new();
        state.add_resources(vec![
            res("http://ok", "ok"),
            res("http://bad", "bad"),
            res("http://unknown", "unknown"),
        ]);

        let hydrated = state.hydrate(&cache);
        assert_eq!(hydrated.len(), 1);
        assert_eq!(hydrated[0].content.as_deref(), Some("text"));
        // The underlying list is untouched.
        assert_eq!(state.resources.len(), 3);
    }

    #[test]
    fn test_absorb_resource_content_seeds_cache() {
        let cache = ResourceCache::new();
        let mut state = AgentState::new();
        state.resources = vec![
            res("http://x", "x").with_content("ERROR"),
            res("http://y", "y").with_content("Some article"),
            res("http://y", "dup"),
        ];

        state.absorb_resource_content(&cache);

        assert_eq!(state.resources.len(), 2);
        assert!(state.resources.iter().all(|r| r.content.is_none()));
        assert!(cache.get("http://x").unwrap().is_failed());
        assert_eq!(cache.content("http://y").as_deref(), Some("Some article"));
    }
}
