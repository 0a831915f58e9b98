pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod meta;
pub mod ollama;
pub mod openai;

use crate::context::CallContext;
use crate::error::ProviderError;
use crate::options::{ChatOptions, ChatRequest};
use crate::stream::EventStream;
use crate::transport::Transport;
use crate::types::{Message, Response};
use async_trait::async_trait;

/// One LLM vendor behind the canonical chat/stream contract.
///
/// Implementations are shared across tasks; every method takes `&self`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Model ids this provider accepts, exactly as they must be passed.
    fn models(&self) -> Vec<String>;

    async fn chat(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<Response, ProviderError>;

    /// Start a streaming call. Connection-level failures (after retries) are
    /// returned here; anything later arrives as a terminal `Error` event.
    async fn stream(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<EventStream, ProviderError>;

    fn validate_model(&self, model: &str) -> Result<(), ProviderError> {
        validate_model(self.name(), model, &self.models())
    }

    /// Release resources. Safe to call more than once.
    fn close(&self) -> Result<(), ProviderError>;
}

/// Succeeds iff `model` is exactly one of `supported`.
pub fn validate_model<S: AsRef<str>>(
    provider: &str,
    model: &str,
    supported: &[S],
) -> Result<(), ProviderError> {
    if !model.is_empty() && supported.iter().any(|m| m.as_ref() == model) {
        return Ok(());
    }
    Err(ProviderError::InvalidModel {
        provider: provider.to_string(),
        model: model.to_string(),
        supported: supported.iter().map(|m| m.as_ref().to_string()).collect(),
    })
}

/// Shared entry checks: provider open, options in range, model supported.
pub(crate) fn prepare<S: AsRef<str>>(
    transport: &Transport,
    supported: &[S],
    messages: &[Message],
    opts: ChatOptions,
) -> Result<ChatRequest, ProviderError> {
    transport.ensure_open()?;
    let request = opts.into_request(messages)?;
    validate_model(transport.provider(), &request.model, supported)?;
    Ok(request)
}

pub(crate) fn owned_models(models: &[&str]) -> Vec<String> {
    models.iter().map(|m| m.to_string()).collect()
}
