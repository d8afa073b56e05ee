use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use qr_agent::{AgentConfig, DEFAULT_MODEL};
use qr_providers::ModelSettings;
use qr_tools::{FetchConfig, TavilyConfig};

const ENV_PREFIX: &str = "QR_";
const REDACTED: &str = "********";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Model used by sessions that don't name one
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,

    #[serde(default)]
    pub search: SearchSection,

    #[serde(default)]
    pub fetch: FetchSection,

    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub server: ServerSection,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

/// A named model selectable per session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Backend type (openai, anthropic, gemini); inferred from the name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSection {
    /// Tavily key; falls back to TAVILY_API_KEY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_search_depth")]
    pub search_depth: String,
}

fn default_max_results() -> usize {
    5
}

fn default_search_depth() -> String {
    "advanced".to_string()
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            max_results: default_max_results(),
            search_depth: default_search_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Converted page text beyond this length is truncated
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_max_chars() -> usize {
    50_000
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            user_agent: None,
            max_chars: default_max_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Chat re-entries allowed per user turn
    #[serde(default = "default_max_reentries")]
    pub max_reentries: usize,

    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,
}

fn default_max_reentries() -> usize {
    10
}

fn default_model_timeout() -> u64 {
    120
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_reentries: default_max_reentries(),
            model_timeout_secs: default_model_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        models.insert(
            "openai".to_string(),
            ModelEntry {
                model: Some("gpt-4".to_string()),
                temperature: Some(0.0),
                ..Default::default()
            },
        );
        models.insert(
            "anthropic".to_string(),
            ModelEntry {
                model: Some("claude-3-opus-20240229".to_string()),
                temperature: Some(0.0),
                ..Default::default()
            },
        );
        models.insert(
            "google_genai".to_string(),
            ModelEntry {
                model: Some("gemini-pro".to_string()),
                ..Default::default()
            },
        );

        Self {
            default_model: default_model(),
            models,
            search: SearchSection::default(),
            fetch: FetchSection::default(),
            agent: AgentSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl Config {
    /// Load built-in defaults, then the TOML file, then `QR_` environment
    /// variables (`__` separates nested keys, e.g. `QR_SERVER__BIND`).
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => Self::config_path()?,
        };

        Self::figment()
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    #[cfg(test)]
    fn from_toml_str(content: &str) -> Result<Self> {
        Ok(Self::figment().merge(Toml::string(content)).extract()?)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("qr"))
    }

    pub fn model_settings(&self) -> Vec<ModelSettings> {
        self.models
            .iter()
            .map(|(name, entry)| ModelSettings {
                name: name.clone(),
                provider_type: entry.provider.clone(),
                model: entry.model.clone(),
                api_key: entry.api_key.clone(),
                base_url: entry.base_url.clone(),
                temperature: entry.temperature,
            })
            .collect()
    }

    pub fn tavily_config(&self) -> TavilyConfig {
        let defaults = TavilyConfig::default();
        TavilyConfig {
            api_key: self
                .search
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .or_else(|| std::env::var("TAVILY_API_KEY").ok()),
            base_url: self.search.base_url.clone().unwrap_or(defaults.base_url),
            max_results: self.search.max_results,
            search_depth: self.search.search_depth.clone(),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        let defaults = FetchConfig::default();
        FetchConfig {
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            user_agent: self.fetch.user_agent.clone().unwrap_or(defaults.user_agent),
            max_chars: self.fetch.max_chars,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig::default()
            .with_max_reentries(self.agent.max_reentries)
            .with_model_timeout(Duration::from_secs(self.agent.model_timeout_secs))
    }

    /// Copy with every API key masked, for display.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for entry in config.models.values_mut() {
            if entry.api_key.is_some() {
                entry.api_key = Some(REDACTED.to_string());
            }
        }
        if config.search.api_key.is_some() {
            config.search.api_key = Some(REDACTED.to_string());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qr_providers::Backend;

    #[test]
    fn test_defaults_match_builtin_models() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.default_model, "openai");
        assert_eq!(config.models.len(), 3);
        assert_eq!(config.models["openai"].model.as_deref(), Some("gpt-4"));
        assert_eq!(config.models["openai"].temperature, Some(0.0));
        assert_eq!(
            config.models["anthropic"].model.as_deref(),
            Some("claude-3-opus-20240229")
        );
        assert_eq!(config.models["google_genai"].model.as_deref(), Some("gemini-pro"));
        assert_eq!(config.search.max_results, 5);
        assert_eq!(config.fetch.timeout_secs, 10);
        assert_eq!(config.agent.max_reentries, 10);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
    }

    #[test]
    fn test_file_merges_over_defaults() {
        let toml = r#"
default_model = "anthropic"

[models.openai]
api_key = "sk-test"

[models.local]
base_url = "http://localhost:11434/v1"
model = "llama3"

[agent]
max_reentries = 3

[server]
bind = "0.0.0.0:9000"
"#;
        let config = Config::from_toml_str(toml).unwrap();

        assert_eq!(config.default_model, "anthropic");
        // Partial model entries keep their built-in values
        assert_eq!(config.models["openai"].api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.models["openai"].model.as_deref(), Some("gpt-4"));
        assert_eq!(config.models["local"].model.as_deref(), Some("llama3"));
        assert_eq!(config.models.len(), 4);
        assert_eq!(config.agent.max_reentries, 3);
        assert_eq!(config.agent.model_timeout_secs, 120);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_model_settings_infer_provider() {
        let config = Config::from_toml_str("").unwrap();
        let settings = config.model_settings();
        let google = settings.iter().find(|s| s.name == "google_genai").unwrap();
        assert_eq!(google.backend(), Backend::Gemini);
        let anthropic = settings.iter().find(|s| s.name == "anthropic").unwrap();
        assert_eq!(anthropic.backend(), Backend::Anthropic);
    }

    #[test]
    fn test_agent_and_fetch_config() {
        let config = Config::from_toml_str("[fetch]\ntimeout_secs = 3\nmax_chars = 100\n").unwrap();
        let fetch = config.fetch_config();
        assert_eq!(fetch.timeout, Duration::from_secs(3));
        assert_eq!(fetch.max_chars, 100);
        assert!(fetch.user_agent.starts_with("qr/"));

        let agent = config.agent_config();
        assert_eq!(agent.max_reentries, 10);
        assert_eq!(agent.model_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_redacted_hides_keys() {
        let config = Config::from_toml_str(
            "[models.openai]\napi_key = \"sk-secret\"\n[search]\napi_key = \"tvly-secret\"\n",
        )
        .unwrap();
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("secret"));
        assert!(shown.contains(REDACTED));
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/qr/config.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
