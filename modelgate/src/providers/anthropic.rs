use super::{Provider, owned_models, prepare};
use crate::classify::{self, ErrorTable};
use crate::codec::sse::{SseDecoder, SseEvent};
use crate::context::CallContext;
use crate::decoder::{Assembler, StreamDecoder};
use crate::error::{ErrorKind, ProviderError};
use crate::options::{ChatOptions, ChatRequest};
use crate::retry::RetryConfig;
use crate::stream::{self, EventStream};
use crate::transport::{HttpOptions, RequestSpec, Transport, http_option_setters};
use crate::types::{EventKind, Message, Response, ThinkingPhase, UsageInfo};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const ANTHROPIC_MODELS: &[&str] = &[
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    "claude-opus-4-1",
    "claude-sonnet-4-5",
    "claude-haiku-4-5",
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
    "claude-3-sonnet-20240229",
];

pub static ANTHROPIC_ERRORS: ErrorTable = ErrorTable {
    provider: "anthropic",
    markers: &[
        ("authentication_error", ErrorKind::Authentication),
        ("permission_error", ErrorKind::Authentication),
        ("rate_limit_error", ErrorKind::RateLimited),
        ("overloaded_error", ErrorKind::ServerError),
        ("api_error", ErrorKind::ServerError),
        ("not_found_error", ErrorKind::Validation),
        ("invalid_request_error", ErrorKind::Validation),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Option<Self> {
        std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Self::new)
    }
}

http_option_setters!(AnthropicConfig);

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    transport: Arc<Transport>,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::api(
                ANTHROPIC_ERRORS.provider,
                ErrorKind::Authentication,
                "API key is required",
            ));
        }
        let transport = Transport::new(&ANTHROPIC_ERRORS, &config.http, RetryConfig::default())?;
        Ok(Self {
            base_url: config
                .base_url
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key,
            models: owned_models(ANTHROPIC_MODELS),
            transport: Arc::new(transport),
        })
    }

    fn build(&self, req: &ChatRequest, stream: bool) -> Result<RequestSpec, ProviderError> {
        let body = MessagesRequest {
            model: &req.model,
            messages: req
                .conversation()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: req.max_tokens,
            system: req.system_text(),
            temperature: req.temperature,
            top_p: req.top_p_override(),
            stop_sequences: &req.stop_sequences,
            metadata: req.metadata.get("user_id").map(|id| RequestMetadata { user_id: id }),
            stream,
        };
        let spec = RequestSpec::post_json(format!("{}/messages", self.base_url), &body)?
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION);
        Ok(if stream {
            spec.header("Accept", "text/event-stream").streaming()
        } else {
            spec
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        ANTHROPIC_ERRORS.provider
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<Response, ProviderError> {
        let req = prepare(&self.transport, &self.models, messages, opts)?;
        let spec = self.build(&req, false)?;
        let resp: MessagesResponse = self.transport.send_json(ctx, &spec).await?;

        let mut content = String::new();
        let mut reasoning = String::new();
        for block in resp.content {
            match block.block_type.as_str() {
                "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
                "thinking" => reasoning.push_str(block.thinking.as_deref().unwrap_or_default()),
                _ => {}
            }
        }
        Ok(Response {
            content,
            model: resp.model.unwrap_or(req.model),
            provider: ANTHROPIC_ERRORS.provider.to_string(),
            finish_reason: resp.stop_reason,
            usage: UsageInfo::new(resp.usage.input_tokens, resp.usage.output_tokens),
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            created_at: Utc::now(),
        })
    }

    async fn stream(
        &self,
        ctx: &CallContext,
        messages: &[Message],
        opts: ChatOptions,
    ) -> Result<EventStream, ProviderError> {
        let req = prepare(&self.transport, &self.models, messages, opts)?;
        let spec = self.build(&req, true)?;
        let response = self.transport.send(ctx, &spec).await?;
        Ok(stream::spawn(
            ctx.clone(),
            self.transport.clone(),
            spec,
            response,
            anthropic_decoder,
        ))
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.transport.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<RequestMetadata<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct RequestMetadata<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: UsageData,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Deserialize, Default)]
struct UsageData {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct StreamEventData {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    content_block: Option<StartBlock>,
    #[serde(default)]
    delta: Option<DeltaData>,
    #[serde(default)]
    message: Option<MessageData>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Deserialize)]
struct StartBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Deserialize)]
struct DeltaData {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageData {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<UsageData>,
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

fn anthropic_decoder(_headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    Box::new(MessagesDecoder::default())
}

/// Decoder for the Messages API SSE stream.
#[derive(Default)]
pub struct MessagesDecoder {
    sse: SseDecoder,
    asm: Assembler,
    thinking_blocks: BTreeSet<usize>,
    stop_reason: Option<String>,
}

impl MessagesDecoder {
    fn handle(&mut self, event: SseEvent) {
        if event.data.is_empty() {
            return;
        }
        let data: StreamEventData = match serde_json::from_str(&event.data) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "skipping malformed anthropic event");
                return;
            }
        };
        match data.event_type.as_str() {
            "message_start" => {
                let message = data.message;
                let model = message.as_ref().and_then(|m| m.model.as_deref()).unwrap_or_default();
                self.asm.message_start(model);
                if let Some(usage) = message.and_then(|m| m.usage) {
                    self.asm.usage_report(usage.input_tokens, usage.output_tokens);
                }
            }
            "content_block_start" => {
                let (Some(index), Some(block)) = (data.index, data.content_block) else {
                    return;
                };
                match block.block_type.as_str() {
                    "thinking" => {
                        self.thinking_blocks.insert(index);
                        self.asm.thinking(Some(index), ThinkingPhase::Start, "");
                        if let Some(text) = block.thinking {
                            self.asm.thinking(Some(index), ThinkingPhase::Delta, &text);
                        }
                    }
                    "text" => {
                        if let Some(text) = block.text {
                            self.asm.delta(Some(index), &text);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = data.delta else { return };
                if let Some(text) = delta.text {
                    self.asm.delta(data.index, &text);
                }
                if let Some(thinking) = delta.thinking {
                    self.asm.thinking(data.index, ThinkingPhase::Delta, &thinking);
                }
            }
            "content_block_stop" => {
                let Some(index) = data.index else { return };
                if self.thinking_blocks.remove(&index) {
                    self.asm.thinking(Some(index), ThinkingPhase::End, "");
                }
                self.asm.block_stop(index);
            }
            "message_delta" => {
                if let Some(reason) = data.delta.and_then(|d| d.stop_reason) {
                    self.stop_reason = Some(reason);
                }
                if let Some(usage) = data.usage {
                    self.asm.usage_report(usage.input_tokens, usage.output_tokens);
                }
            }
            "message_stop" => {
                let reason = self.stop_reason.take();
                self.asm.message_stop(reason.as_deref());
                self.asm.done();
            }
            "error" => {
                let (kind, message) = classify::from_stream(&ANTHROPIC_ERRORS, &event.data);
                self.asm.error(kind, message);
            }
            "ping" => {}
            other => debug!(event_type = other, "ignoring anthropic event"),
        }
    }
}

impl StreamDecoder for MessagesDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<EventKind> {
        for event in self.sse.feed(chunk) {
            self.handle(event);
        }
        self.asm.drain()
    }

    fn finish(&mut self) -> Vec<EventKind> {
        for event in self.sse.finish() {
            self.handle(event);
        }
        self.asm.eof();
        self.asm.drain()
    }
}
