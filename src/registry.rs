use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{KnownProvider, LlmSettings, ProviderKind, ProviderSettings};
use crate::inference::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter};

/// Provider id -> adapter. Rebuilt wholesale whenever settings change,
/// never patched incrementally.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from settings.
    pub fn from_settings(settings: &LlmSettings) -> Self {
        let mut registry = Self::new();
        registry.rebuild(settings);
        registry
    }

    /// Clear everything, then register an adapter for every enabled,
    /// fully configured provider.
    pub fn rebuild(&mut self, settings: &LlmSettings) {
        self.clear();

        for (id, provider) in &settings.providers {
            if !provider.enabled {
                debug!(provider = %id, "provider disabled, skipping");
                continue;
            }
            let Some(known) = KnownProvider::lookup(id) else {
                debug!(provider = %id, "unknown provider id, skipping");
                continue;
            };
            match build_adapter(&known, provider) {
                Some(adapter) => self.register(adapter),
                None => debug!(provider = %id, "provider has no API key, skipping"),
            }
        }

        info!(providers = ?self.available(), "adapter registry rebuilt");
    }

    /// Register an adapter under its own id, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    /// Registered provider ids, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Adapters in id order.
    pub fn adapters(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.available()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.adapters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

fn build_adapter(
    known: &KnownProvider,
    settings: &ProviderSettings,
) -> Option<Arc<dyn ProviderAdapter>> {
    let api_key = settings.api_key.clone().filter(|k| !k.is_empty());
    if known.requires_api_key() && api_key.is_none() {
        return None;
    }
    let base_url = settings
        .base_url
        .clone()
        .unwrap_or_else(|| known.default_base_url.to_string());

    let adapter: Arc<dyn ProviderAdapter> = match known.kind {
        ProviderKind::Anthropic => {
            Arc::new(AnthropicAdapter::new(api_key.unwrap_or_default()).with_base_url(base_url))
        }
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new().with_base_url(base_url)),
        ProviderKind::OpenAiCompatible => {
            let mut adapter = OpenAiAdapter::new(base_url).with_id(known.id);
            if let Some(key) = api_key {
                adapter = adapter.with_api_key(key);
            }
            if known.local {
                adapter = adapter.local();
            }
            Arc::new(adapter)
        }
    };
    Some(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;

    fn settings() -> LlmSettings {
        LlmSettings::default()
            .with_provider("openai", ProviderSettings::with_api_key("sk"))
            .with_provider("anthropic", ProviderSettings::with_api_key("ak"))
            .with_provider("ollama", ProviderSettings::local("http://localhost:11434"))
            .with_provider(
                "groq",
                ProviderSettings {
                    enabled: true,
                    api_key: None,
                    base_url: None,
                },
            )
            .with_provider(
                "mistral",
                ProviderSettings {
                    enabled: false,
                    api_key: Some("mk".into()),
                    base_url: None,
                },
            )
            .with_provider("perplexity", ProviderSettings::with_api_key("pk"))
    }

    #[test]
    fn builds_only_usable_providers() {
        let registry = AdapterRegistry::from_settings(&settings());
        assert_eq!(registry.available(), vec!["anthropic", "ollama", "openai"]);
        assert_eq!(registry.get("openai").unwrap().id(), "openai");
        assert!(registry.get("groq").is_none());
    }

    #[test]
    fn openai_compatible_ids_are_preserved() {
        let settings =
            LlmSettings::default().with_provider("openrouter", ProviderSettings::with_api_key("or"));
        let registry = AdapterRegistry::from_settings(&settings);
        assert_eq!(registry.get("openrouter").unwrap().id(), "openrouter");
    }

    #[test]
    fn rebuild_clears_previous_adapters() {
        let mut registry = AdapterRegistry::from_settings(&settings());
        assert_eq!(registry.len(), 3);

        let only_ollama =
            LlmSettings::default().with_provider("ollama", ProviderSettings::local("http://x"));
        registry.rebuild(&only_ollama);
        assert_eq!(registry.available(), vec!["ollama"]);
    }

    #[test]
    fn adapters_in_id_order() {
        let registry = AdapterRegistry::from_settings(&settings());
        let ids: Vec<String> = registry.adapters().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["anthropic", "ollama", "openai"]);
    }
}
