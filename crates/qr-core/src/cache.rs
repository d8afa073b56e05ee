//! Shared store of downloaded resource text, keyed by URL.
//!
//! One instance is owned by the application and handed to every session and
//! fetcher. Entries are never evicted.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Marker prefix used by frontends that store fetch failures as content.
pub const ERROR_MARKER_PREFIX: &str = "Error downloading resource: ";

/// Bare failure marker some clients send instead of the full prefix.
pub const LEGACY_ERROR_MARKER: &str = "ERROR";

/// Outcome of a fetch attempt, as remembered by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CachedResource {
    /// Readable text converted from the downloaded page.
    Fetched(String),
    /// The download failed; holds the cause.
    Failed(String),
}

impl CachedResource {
    pub fn content(&self) -> Option<&str> {
        match self {
            CachedResource::Fetched(text) => Some(text),
            CachedResource::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CachedResource::Failed(_))
    }

    /// Render in the string-marker convention (`"Error downloading resource: <cause>"`).
    pub fn to_marker_string(&self) -> String {
        match self {
            CachedResource::Fetched(text) => text.clone(),
            CachedResource::Failed(cause) => format!("{}{}", ERROR_MARKER_PREFIX, cause),
        }
    }

    /// Parse content that may carry a string failure marker.
    pub fn from_marker_string(value: &str) -> Self {
        if value == LEGACY_ERROR_MARKER {
            CachedResource::Failed("unknown error".to_string())
        } else if let Some(cause) = value.strip_prefix(ERROR_MARKER_PREFIX) {
            CachedResource::Failed(cause.to_string())
        } else {
            CachedResource::Fetched(value.to_string())
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: RwLock<HashMap<String, CachedResource>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a URL. Never fails; absent URLs yield `None`.
    pub fn get(&self, url: &str) -> Option<CachedResource> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(url).cloned()
    }

    /// Fetched text for a URL, or `None` when absent or failed.
    pub fn content(&self, url: &str) -> Option<String> {
        self.get(url)
            .and_then(|entry| entry.content().map(str::to_string))
    }

    /// Insert or overwrite the entry for a URL; the last write wins.
    pub fn put(&self, url: impl Into<String>, entry: CachedResource) {
        let url = url.into();
        debug!(url = %url, failed = entry.is_failed(), "Caching resource");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(url, entry);
    }

    /// Seed the cache from client-held content without clobbering a real fetch
    /// with a failure marker.
    pub fn seed(&self, url: &str, content: &str) {
        let incoming = CachedResource::from_marker_string(content);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(url) {
            Some(CachedResource::Fetched(_)) if incoming.is_failed() => {}
            _ => {
                entries.insert(url.to_string(), incoming);
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
