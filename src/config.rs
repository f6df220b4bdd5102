//! Provider settings and defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Tool-call rounds allowed in one streamed generation before the
/// orchestrator stops and asks the user.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 15;

/// How a known provider id is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    Ollama,
}

/// (id, kind, default base URL, API key env var, runs locally)
const KNOWN_PROVIDERS: &[(&str, ProviderKind, &str, Option<&str>, bool)] = &[
    ("openai", ProviderKind::OpenAiCompatible, "https://api.openai.com", Some("OPENAI_API_KEY"), false),
    ("anthropic", ProviderKind::Anthropic, "https://api.anthropic.com", Some("ANTHROPIC_API_KEY"), false),
    ("openrouter", ProviderKind::OpenAiCompatible, "https://openrouter.ai/api", Some("OPENROUTER_API_KEY"), false),
    ("groq", ProviderKind::OpenAiCompatible, "https://api.groq.com/openai", Some("GROQ_API_KEY"), false),
    ("mistral", ProviderKind::OpenAiCompatible, "https://api.mistral.ai", Some("MISTRAL_API_KEY"), false),
    ("ollama", ProviderKind::Ollama, "http://localhost:11434", None, true),
    ("lmstudio", ProviderKind::OpenAiCompatible, "http://localhost:1234", None, true),
];

/// Static description of a provider id this crate knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProvider {
    pub id: &'static str,
    pub kind: ProviderKind,
    pub default_base_url: &'static str,
    pub api_key_env: Option<&'static str>,
    pub local: bool,
}

impl KnownProvider {
    pub fn lookup(id: &str) -> Option<Self> {
        KNOWN_PROVIDERS
            .iter()
            .find(|(known, ..)| *known == id)
            .map(|&(id, kind, default_base_url, api_key_env, local)| Self {
                id,
                kind,
                default_base_url,
                api_key_env,
                local,
            })
    }

    pub fn all() -> impl Iterator<Item = Self> {
        KNOWN_PROVIDERS
            .iter()
            .filter_map(|(id, ..)| Self::lookup(id))
    }

    /// Local providers work without a key.
    pub fn requires_api_key(&self) -> bool {
        self.api_key_env.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderSettings {
    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            api_key: Some(key.into()),
            base_url: None,
        }
    }

    pub fn local(base_url: impl Into<String>) -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: Some(base_url.into()),
        }
    }
}

/// Everything the orchestrator needs to build adapters and pick defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Capacity of the channel between a stream producer and its consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Monthly spend ceiling in USD. `None` disables budget checks.
    #[serde(default)]
    pub budget: Option<f64>,
}

fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}

fn default_stream_buffer() -> usize {
    64
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_provider: None,
            default_model: None,
            providers: BTreeMap::new(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            stream_buffer: default_stream_buffer(),
            budget: None,
        }
    }
}

impl LlmSettings {
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::Configuration(format!("reading {}: {e}", path.display()))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            OrchestratorError::Configuration(format!("parsing {}: {e}", path.display()))
        })
    }

    pub fn with_default(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self.default_model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, id: impl Into<String>, settings: ProviderSettings) -> Self {
        self.providers.insert(id.into(), settings);
        self
    }

    /// Fill missing API keys from the environment. Keys already present win.
    pub fn with_env_keys(self) -> Self {
        self.with_keys_from(|var| std::env::var(var).ok())
    }

    pub(crate) fn with_keys_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for known in KnownProvider::all() {
            let Some(var) = known.api_key_env else {
                continue;
            };
            let Some(key) = lookup(var).filter(|k| !k.is_empty()) else {
                continue;
            };
            let entry = self
                .providers
                .entry(known.id.to_string())
                .or_insert_with(|| ProviderSettings {
                    enabled: true,
                    api_key: None,
                    base_url: None,
                });
            if entry.api_key.is_none() {
                entry.api_key = Some(key);
            }
        }
        self
    }
}
