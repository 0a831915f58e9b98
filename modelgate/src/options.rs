use crate::error::ProviderError;
use crate::types::{Message, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Per-call settings. Each `with_*` setter is independent; validation
/// happens once in [`ChatOptions::into_request`], before any network I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: Option<String>,
    pub stop_sequences: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            system_prompt: None,
            stop_sequences: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check ranges and build the request. Model membership is checked
    /// separately by the provider.
    pub fn into_request(self, messages: &[Message]) -> Result<ChatRequest, ProviderError> {
        if messages.is_empty() {
            return Err(ProviderError::InvalidOption(
                "messages must not be empty".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(ProviderError::InvalidOption(
                "max_tokens must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ProviderError::InvalidOption(format!(
                "temperature must be between 0.0 and 1.0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ProviderError::InvalidOption(format!(
                "top_p must be between 0.0 and 1.0, got {}",
                self.top_p
            )));
        }
        Ok(ChatRequest {
            messages: messages.to_vec(),
            model: self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            system_prompt: self.system_prompt,
            stop_sequences: self.stop_sequences,
            metadata: self.metadata,
        })
    }
}

/// A validated request, ready for a vendor to serialize.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: Option<String>,
    pub stop_sequences: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ChatRequest {
    /// The system prompt followed by any system-role messages, for vendors
    /// that take system text out of band.
    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .system_prompt
            .as_deref()
            .into_iter()
            .chain(
                self.messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str()),
            )
            .filter(|s| !s.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Messages without the system role.
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    /// Whether top_p differs from the neutral default and should be sent.
    pub fn top_p_override(&self) -> Option<f32> {
        (self.top_p < DEFAULT_TOP_P).then_some(self.top_p)
    }
}
