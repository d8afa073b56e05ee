//! Named model registry.
//!
//! Maps the model names a client may request ("openai", "anthropic",
//! "google_genai", or anything configured) to a ready provider plus the
//! per-model request settings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use qr_core::{CompletionRequest, CompletionResponse, Error, Provider};

use crate::{AnthropicProvider, GeminiProvider, OpenAIProvider};

/// The wire protocol a configured model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// OpenAI chat completions, also used for any compatible server.
    OpenAI,
    Anthropic,
    Gemini,
}

impl Backend {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" | "google_genai" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variables consulted, in order, when no key is configured.
    fn key_vars(self) -> &'static [&'static str] {
        match self {
            Self::OpenAI => &["OPENAI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Gemini => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        }
    }

    fn build(self, settings: &ModelSettings, api_key: &str) -> Arc<dyn Provider> {
        macro_rules! configured {
            ($provider:expr) => {{
                let mut provider = $provider;
                if let Some(model) = &settings.model {
                    provider = provider.with_default_model(model);
                }
                if let Some(base) = &settings.base_url {
                    provider = provider.with_base_url(base);
                }
                Arc::new(provider) as Arc<dyn Provider>
            }};
        }

        match self {
            Self::OpenAI => configured!(OpenAIProvider::new(api_key)),
            Self::Anthropic => configured!(AnthropicProvider::new(api_key)),
            Self::Gemini => configured!(GeminiProvider::new(api_key)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for one named model as read from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    pub name: String,
    /// Explicit backend; inferred from the name and base URL when absent.
    pub provider_type: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
}

impl ModelSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// An explicit type wins. Otherwise a custom base URL means an
    /// OpenAI-compatible endpoint, and failing that the entry name decides.
    pub fn backend(&self) -> Backend {
        if let Some(explicit) = self.provider_type.as_deref() {
            return Backend::parse(explicit).unwrap_or_else(|| {
                warn!(model = %self.name, provider = explicit, "Unknown provider type; assuming OpenAI-compatible");
                Backend::OpenAI
            });
        }
        if self.base_url.is_some() {
            return Backend::OpenAI;
        }
        Backend::parse(&self.name).unwrap_or(Backend::OpenAI)
    }

    /// Configured key, falling back to the backend's conventional env vars.
    pub fn resolved_api_key(&self) -> Option<String> {
        let configured = self.api_key.clone().filter(|k| !k.is_empty());
        configured.or_else(|| {
            self.backend()
                .key_vars()
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        })
    }
}

/// Stand-in for a model whose credentials are missing. Every call fails with
/// an authentication error instead of reaching the network.
struct Unavailable {
    backend: Backend,
    model: String,
}

#[async_trait]
impl Provider for Unavailable {
    fn name(&self) -> &str {
        self.backend.as_str()
    }

    fn default_model(&self) -> Option<&str> {
        None
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, Error> {
        Err(Error::auth(format!("no API key configured for model '{}'", self.model)))
    }
}

/// A provider bound to the settings of one named model.
#[derive(Clone)]
pub struct RegisteredModel {
    pub name: String,
    pub provider: Arc<dyn Provider>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl RegisteredModel {
    /// Fill in whatever the request leaves unset from this model's settings.
    pub fn prepare(&self, mut request: CompletionRequest) -> CompletionRequest {
        request.model = request.model.or_else(|| self.model.clone());
        request.temperature = request.temperature.or(self.temperature);
        request
    }
}

impl fmt::Debug for RegisteredModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredModel")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, RegisteredModel>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            models: HashMap::new(),
            default_model: default_model.into(),
        }
    }

    /// Build a registry from configured settings. Entries without a key are
    /// still registered but fail closed when invoked.
    pub fn from_settings(
        default_model: impl Into<String>,
        settings: impl IntoIterator<Item = ModelSettings>,
    ) -> Self {
        let mut registry = Self::new(default_model);
        for entry in settings {
            let key = entry.resolved_api_key();
            registry.register(entry, key);
        }
        registry
    }

    fn register(&mut self, settings: ModelSettings, api_key: Option<String>) {
        let backend = settings.backend();
        let provider = match api_key {
            Some(key) => backend.build(&settings, &key),
            None => {
                warn!(model = %settings.name, "No API key configured; model will be unavailable");
                Arc::new(Unavailable {
                    backend,
                    model: settings.name.clone(),
                })
            }
        };
        debug!(model = %settings.name, provider = %backend, "Registered model");
        self.insert(RegisteredModel {
            name: settings.name,
            provider,
            model: settings.model,
            temperature: settings.temperature,
        });
    }

    /// Register a model, replacing any previous entry of the same name.
    pub fn insert(&mut self, model: RegisteredModel) {
        self.models.insert(model.name.clone(), model);
    }

    /// Builder form of [`insert`](Self::insert) for an already-built provider.
    pub fn with_model(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: Option<String>,
        temperature: Option<f32>,
    ) -> Self {
        self.insert(RegisteredModel {
            name: name.into(),
            provider,
            model,
            temperature,
        });
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Look up a model by name, or the default when no name is given.
    pub fn resolve(&self, name: Option<&str>) -> Result<&RegisteredModel, Error> {
        let name = name.unwrap_or(&self.default_model);
        self.models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
