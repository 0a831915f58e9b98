//! One configuration value for every vendor, loadable from JSON or the
//! environment, that builds a [`ProviderRegistry`].

use crate::error::ProviderError;
use crate::providers::Provider;
use crate::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use crate::providers::bedrock::{BedrockConfig, BedrockProvider};
use crate::providers::gemini::{GeminiConfig, GeminiProvider};
use crate::providers::meta::{MetaConfig, meta_provider};
use crate::providers::ollama::{OllamaConfig, OllamaProvider};
use crate::providers::openai::{OpenAiConfig, OpenAiProvider};
use crate::registry::{ProviderRegistry, RegistryError};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to create {provider} provider: {source}")]
    Provider {
        provider: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Per-vendor settings. A vendor is registered iff its section is present.
///
/// ```json
/// { "anthropic": { "api_key": "sk-ant-..." }, "ollama": { "model": "llama3" } }
/// ```
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiConfig>,
    pub gemini: Option<GeminiConfig>,
    pub bedrock: Option<BedrockConfig>,
    pub meta: Option<MetaConfig>,
    pub ollama: Option<OllamaConfig>,
}

impl ProvidersConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every vendor whose credentials are present in the environment. Ollama
    /// needs none, so it is included when `OLLAMA_HOST` or `OLLAMA_MODEL` is
    /// set.
    pub fn from_env() -> Self {
        let ollama_configured = ["OLLAMA_HOST", "OLLAMA_MODEL"]
            .iter()
            .any(|name| std::env::var(name).is_ok_and(|v| !v.is_empty()));
        Self {
            anthropic: AnthropicConfig::from_env(),
            openai: OpenAiConfig::from_env(),
            gemini: GeminiConfig::from_env(),
            bedrock: BedrockConfig::from_env(),
            meta: MetaConfig::from_env(),
            ollama: ollama_configured.then(OllamaConfig::from_env),
        }
    }

    /// Names of the vendors this config would register.
    pub fn configured(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.anthropic.is_some() {
            names.push("anthropic");
        }
        if self.bedrock.is_some() {
            names.push("bedrock");
        }
        if self.gemini.is_some() {
            names.push("gemini");
        }
        if self.meta.is_some() {
            names.push("meta");
        }
        if self.ollama.is_some() {
            names.push("ollama");
        }
        if self.openai.is_some() {
            names.push("openai");
        }
        names
    }

    /// Construct and register every configured vendor under its name.
    pub fn into_registry(self) -> Result<ProviderRegistry, ConfigError> {
        let registry = ProviderRegistry::new();
        if let Some(config) = self.anthropic {
            add(&registry, "anthropic", AnthropicProvider::new(config))?;
        }
        if let Some(config) = self.openai {
            add(&registry, "openai", OpenAiProvider::new(config))?;
        }
        if let Some(config) = self.gemini {
            add(&registry, "gemini", GeminiProvider::new(config))?;
        }
        if let Some(config) = self.bedrock {
            add(&registry, "bedrock", BedrockProvider::new(config))?;
        }
        if let Some(config) = self.meta {
            add(&registry, "meta", meta_provider(config))?;
        }
        if let Some(config) = self.ollama {
            add(&registry, "ollama", OllamaProvider::new(config))?;
        }
        info!(providers = ?registry.list(), "provider registry ready");
        Ok(registry)
    }
}

fn add<P: Provider + 'static>(
    registry: &ProviderRegistry,
    name: &'static str,
    provider: Result<P, ProviderError>,
) -> Result<(), ConfigError> {
    let provider = provider.map_err(|source| ConfigError::Provider {
        provider: name,
        source,
    })?;
    debug!(provider = name, "registering provider");
    registry.register(name, Arc::new(provider))?;
    Ok(())
}
