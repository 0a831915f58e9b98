//! Ollama's native `/api/chat` endpoint on a local server.
//!
//! Models are whatever the user has pulled, so any non-empty model name is
//! accepted; [`OllamaProvider::list_local_models`] asks the server.

use super::{Provider, owned_models};
use crate::classify::{self, ErrorTable};
use crate::codec::ndjson::LineDecoder;
use crate::context::CallContext;
use crate::decoder::{Assembler, StreamDecoder};
use crate::error::{ErrorKind, ProviderError};
use crate::options::{ChatOptions, ChatRequest};
use crate::retry::RetryConfig;
use crate::stream::{self, EventStream};
use crate::transport::{HttpOptions, RequestSpec, Transport, http_option_setters};
use crate::types::{EventKind, Message, Response, ThinkingPhase, UsageInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Well-known model names, offered before the server has been asked.
pub const OLLAMA_MODELS: &[&str] = &[
    "llama3.2",
    "llama3.1",
    "llama3",
    "llama2",
    "codellama",
    "mistral",
    "mixtral",
    "phi3",
    "gemma2",
    "qwen2.5-coder",
    "deepseek-r1",
];

pub static OLLAMA_ERRORS: ErrorTable = ErrorTable {
    provider: "ollama",
    markers: &[
        ("exceeds maximum", ErrorKind::ContextLengthExceeded),
        ("out of memory", ErrorKind::Validation),
        ("not found", ErrorKind::Validation),
        ("connection refused", ErrorKind::ServerError),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: Option<String>,
    /// Used when a call does not name a model.
    pub model: Option<String>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl OllamaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Reads `OLLAMA_HOST` (`host:port` or a full URL) and `OLLAMA_MODEL`.
    /// Ollama needs no credentials, so this always yields a config.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            base_url: var("OLLAMA_HOST").map(|host| normalize_host(&host)),
            model: var("OLLAMA_MODEL"),
            ..Self::default()
        }
    }
}

http_option_setters!(OllamaConfig);

fn normalize_host(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Local servers fail fast; a couple of quick retries is enough.
pub fn ollama_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        base_backoff_ms: 500,
        max_backoff_ms: 2_000,
        jitter: 0.1,
    }
}

/// A model installed on the server, from `GET /api/tags`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: LocalModelDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocalModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

pub struct OllamaProvider {
    base_url: String,
    default_model: Option<String>,
    transport: Arc<Transport>,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self, ProviderError> {
        let transport = Transport::new(&OLLAMA_ERRORS, &config.http, ollama_retry())?;
        Ok(Self {
            base_url: config
                .base_url
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            default_model: config.model.filter(|m| !m.is_empty()),
            transport: Arc::new(transport),
        })
    }

    /// Models installed on the server.
    pub async fn list_local_models(&self, ctx: &CallContext) -> Result<Vec<LocalModel>, ProviderError> {
        self.transport.ensure_open()?;
        let spec = RequestSpec::get(format!("{}/api/tags", self.base_url));
        let tags: TagsResponse = self
            .transport
            .send_json(ctx, &spec)
            .await
            .map_err(|e| self.explain(e, ""))?;
        Ok(tags.models)
    }

    pub async fn is_model_available(&self, ctx: &CallContext, model: &str) -> Result<bool, ProviderError> {
        Ok(self
            .list_local_models(ctx)
            .await?
            .iter()
            .any(|m| m.name == model || m.name.strip_suffix(":latest") == Some(model)))
    }

    fn prepare(&self, messages: &[Message], mut opts: ChatOptions) -> Result<ChatRequest, ProviderError> {
        self.transport.ensure_open()?;
        if opts.model.is_empty() {
            if let Some(model) = &self.default_model {
                opts.model = model.clone();
            }
        }
        let request = opts.into_request(messages)?;
        // Calls may name any locally pulled model, listed or not; the server
        // reports unknown ones.
        if request.model.is_empty() {
            return Err(ProviderError::InvalidModel {
                provider: OLLAMA_ERRORS.provider.to_string(),
                model: String::new(),
                supported: self.models(),
            });
        }
        Ok(request)
    }

    fn build(&self, req: &ChatRequest, stream: bool) -> Result<RequestSpec, ProviderError> {
        let system = req.system_text();
        let mut messages: Vec<ChatMessage<'_>> = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(req.conversation().map(|m| ChatMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        let body = ChatBody {
            model: &req.model,
            messages,
            stream,
            options: ModelOptions {
                num_predict: req.max_tokens,
                temperature: req.temperature,
                top_p: req.top_p_override(),
                stop: &req.stop_sequences,
            },
        };
        let spec = RequestSpec::post_json(format!("{}/api/chat", self.base_url), &body)?;
        Ok(if stream { spec.streaming() } else { spec })
    }

    /// Replace raw failures with actionable messages.
    fn explain(&self, err: ProviderError, model: &str) -> ProviderError {
        match err {
            ProviderError::Network(e) if e.is_connect() => ProviderError::api(
                OLLAMA_ERRORS.provider,
                ErrorKind::ServerError,
                format!(
                    "ollama server not running at {}: {e} (ensure Ollama is installed and running)",
                    self.base_url
                ),
            ),
            ProviderError::Api {
                provider,
                kind,
                status,
                message,
                retry_after,
            } => {
                let lower = message.to_lowercase();
                let message = if !model.is_empty() && lower.contains("not found") {
                    format!(
                        "model '{model}' not found: use 'ollama pull {model}' to download it, or 'ollama list' to see available models"
                    )
                } else if lower.contains("out of memory") {
                    format!(
                        "out of memory loading model '{model}': try a smaller model or free up RAM"
                    )
                } else {
                    message
                };
                ProviderError::Api {
                    provider,
                    kind,
                    status,
                    message,
                    retry_after,
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        OLLAMA_ERRORS.provider
    }

    fn models(&self) -> Vec<String> {
        let mut models = owned_models(OLLAMA_MODELS);
        if let Some(model) = &self.default_model {
            if !models.contains(model) {
                models.insert(0, model.clone());
            }
        }
        models
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<Response, ProviderError> {
        let req = self.prepare(messages, opts)?;
        let spec = self.build(&req, false)?;
        let resp: ChatChunk = self
            .transport
            .send_json(ctx, &spec)
            .await
            .map_err(|e| self.explain(e, &req.model))?;
        if let Some(error) = resp.error {
            let (kind, message) = classify::from_stream(&OLLAMA_ERRORS, &error);
            return Err(self.explain(ProviderError::api(OLLAMA_ERRORS.provider, kind, message), &req.model));
        }
        if !resp.done {
            return Err(ProviderError::api(
                OLLAMA_ERRORS.provider,
                ErrorKind::ServerError,
                "incomplete response received",
            ));
        }
        let message = resp.message.unwrap_or_default();
        Ok(Response {
            content: message.content,
            model: resp.model.unwrap_or(req.model),
            provider: OLLAMA_ERRORS.provider.to_string(),
            finish_reason: resp.done_reason,
            usage: UsageInfo::new(resp.prompt_eval_count, resp.eval_count),
            reasoning: message.thinking.filter(|t| !t.is_empty()),
            created_at: Utc::now(),
        })
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        let req = self.prepare(messages, opts)?;
        let spec = self.build(&req, true)?;
        let response = self
            .transport
            .send(ctx, &spec)
            .await
            .map_err(|e| self.explain(e, &req.model))?;
        Ok(stream::spawn(
            ctx.clone(),
            self.transport.clone(),
            spec,
            response,
            ollama_decoder,
        ))
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.transport.close();
        Ok(())
    }
}

// ---- Wire types ----

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ModelOptions<'a>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ModelOptions<'a> {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
}

/// One `/api/chat` object: a stream line, or the whole non-streaming reply.
#[derive(Deserialize, Default)]
struct ChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<LocalModel>,
}

// ---- Stream decoding ----

fn ollama_decoder(_headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    Box::new(OllamaStreamDecoder::default())
}

#[derive(Default)]
pub struct OllamaStreamDecoder {
    lines: LineDecoder,
    asm: Assembler,
    model_seen: bool,
    thinking: bool,
}

impl OllamaStreamDecoder {
    fn end_thinking(&mut self) {
        if self.thinking {
            self.thinking = false;
            self.asm.thinking(None, ThinkingPhase::End, "");
        }
    }

    fn handle_line(&mut self, line: &str) {
        let chunk: ChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping malformed ollama line");
                return;
            }
        };
        if let Some(error) = chunk.error {
            let (kind, message) = classify::from_stream(&OLLAMA_ERRORS, &error);
            self.asm.error(kind, message);
            return;
        }
        if !self.model_seen {
            if let Some(model) = chunk.model.as_deref() {
                self.model_seen = true;
                self.asm.message_start(model);
            }
        }
        if let Some(message) = chunk.message {
            if let Some(thinking) = message.thinking.filter(|t| !t.is_empty()) {
                if !self.thinking {
                    self.thinking = true;
                    self.asm.thinking(None, ThinkingPhase::Start, "");
                }
                self.asm.thinking(None, ThinkingPhase::Delta, &thinking);
            }
            if !message.content.is_empty() {
                self.end_thinking();
                self.asm.delta(None, &message.content);
            }
        }
        if chunk.done {
            self.end_thinking();
            self.asm.usage_report(chunk.prompt_eval_count, chunk.eval_count);
            self.asm.message_stop(chunk.done_reason.as_deref());
            self.asm.done();
        }
    }
}

impl StreamDecoder for OllamaStreamDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<EventKind> {
        for line in self.lines.feed(chunk) {
            self.handle_line(&line);
        }
        self.asm.drain()
    }

    fn finish(&mut self) -> Vec<EventKind> {
        if let Some(line) = self.lines.finish() {
            self.handle_line(&line);
        }
        self.asm.eof();
        self.asm.drain()
    }
}
