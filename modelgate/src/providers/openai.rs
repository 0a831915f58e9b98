//! OpenAI `/chat/completions`, and the wire format other OpenAI-compatible
//! vendors reuse.

use super::{Provider, owned_models, prepare};
use crate::classify::{self, ErrorTable};
use crate::codec::ndjson::{LineDecoder, data_payload};
use crate::context::CallContext;
use crate::decoder::{Assembler, StreamDecoder};
use crate::error::{ErrorKind, ProviderError};
use crate::options::{ChatOptions, ChatRequest};
use crate::retry::RetryConfig;
use crate::stream::{self, DecoderFactory, EventStream};
use crate::transport::{HttpOptions, RequestSpec, Transport, http_option_setters};
use crate::types::{EventKind, Message, Response, ThinkingPhase, UsageInfo};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub const OPENAI_MODELS: &[&str] = &[
    "gpt-4-turbo-preview",
    "gpt-4-0125-preview",
    "gpt-4-1106-preview",
    "gpt-4",
    "gpt-4-0613",
    "gpt-4-32k",
    "gpt-4-32k-0613",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-0125",
    "gpt-3.5-turbo-1106",
    "gpt-3.5-turbo-16k",
    "gpt-3.5-turbo-16k-0613",
];

pub static OPENAI_ERRORS: ErrorTable = ErrorTable {
    provider: "openai",
    markers: &[
        ("incorrect api key", ErrorKind::Authentication),
        ("invalid_api_key", ErrorKind::Authentication),
        ("insufficient_quota", ErrorKind::RateLimited),
        ("rate_limit_exceeded", ErrorKind::RateLimited),
        ("content_policy_violation", ErrorKind::ContentBlocked),
        ("content_filter", ErrorKind::ContentBlocked),
        ("server_error", ErrorKind::ServerError),
        ("model_not_found", ErrorKind::Validation),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    /// Sent as `OpenAI-Organization`.
    pub organization: Option<String>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads `OPENAI_API_KEY` and, if set, `OPENAI_ORG_ID`.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())?;
        let mut config = Self::new(key);
        config.organization = std::env::var("OPENAI_ORG_ID").ok().filter(|o| !o.is_empty());
        Some(config)
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }
}

http_option_setters!(OpenAiConfig);

/// Provider that speaks the OpenAI chat-completions protocol.
pub struct OpenAiProvider {
    name: &'static str,
    base_url: String,
    api_key: String,
    headers: Vec<(String, String)>,
    models: Vec<String>,
    transport: Arc<Transport>,
    decoder: DecoderFactory,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let mut headers = Vec::new();
        if let Some(org) = config.organization.filter(|o| !o.is_empty()) {
            headers.push(("OpenAI-Organization".to_string(), org));
        }
        Self::compatible(CompatibleSpec {
            errors: &OPENAI_ERRORS,
            api_key: config.api_key,
            base_url: config.base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            headers,
            models: owned_models(OPENAI_MODELS),
            http: config.http,
            retry: RetryConfig::default(),
            decoder: openai_decoder,
        })
    }

    pub(crate) fn compatible(spec: CompatibleSpec) -> Result<Self, ProviderError> {
        if spec.api_key.is_empty() {
            return Err(ProviderError::api(
                spec.errors.provider,
                ErrorKind::Authentication,
                "API key is required",
            ));
        }
        let transport = Transport::new(spec.errors, &spec.http, spec.retry)?;
        Ok(Self {
            name: spec.errors.provider,
            base_url: spec.base_url.trim_end_matches('/').to_string(),
            api_key: spec.api_key,
            headers: spec.headers,
            models: spec.models,
            transport: Arc::new(transport),
            decoder: spec.decoder,
        })
    }

    fn chat_completions_url(&self) -> String {
        if self.base_url.ends_with("/chat/completions") {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn build(&self, req: &ChatRequest, stream: bool) -> Result<RequestSpec, ProviderError> {
        let system = req.system_text();
        let mut messages = Vec::with_capacity(req.messages.len() + 1);
        if let Some(system) = &system {
            messages.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        messages.extend(req.conversation().map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));
        let body = WireRequest {
            model: &req.model,
            messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p_override(),
            stop: (!req.stop_sequences.is_empty()).then_some(&req.stop_sequences),
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        };
        let mut spec = RequestSpec::post_json(self.chat_completions_url(), &body)?
            .header("Authorization", format!("Bearer {}", self.api_key));
        for (name, value) in &self.headers {
            spec = spec.header(name, value.clone());
        }
        if stream {
            spec = spec.header("Accept", "text/event-stream").streaming();
        }
        Ok(spec)
    }
}

pub(crate) struct CompatibleSpec {
    pub errors: &'static ErrorTable,
    pub api_key: String,
    pub base_url: String,
    pub headers: Vec<(String, String)>,
    pub models: Vec<String>,
    pub http: HttpOptions,
    pub retry: RetryConfig,
    pub decoder: DecoderFactory,
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
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
        let resp: WireResponse = self.transport.send_json(ctx, &spec).await?;
        let choice = resp.choices.into_iter().next().ok_or_else(|| {
            ProviderError::api(self.name, ErrorKind::ServerError, "response contained no choices")
        })?;
        let usage = resp
            .usage
            .map(|u| UsageInfo::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        Ok(Response {
            content: choice.message.content.unwrap_or_default(),
            model: resp.model.unwrap_or(req.model),
            provider: self.name.to_string(),
            finish_reason: choice.finish_reason,
            usage,
            reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
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
            self.decoder,
        ))
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.transport.close();
        Ok(())
    }
}

// ---- Request/response types (OpenAI wire format) ----

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

// ---- Stream decoding ----

pub(crate) fn openai_decoder(_headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    Box::new(ChatCompletionsDecoder::new(&OPENAI_ERRORS))
}

/// Decodes `data: {chunk}` lines terminated by `data: [DONE]`.
pub struct ChatCompletionsDecoder {
    lines: LineDecoder,
    asm: Assembler,
    errors: &'static ErrorTable,
    model_seen: bool,
    reasoning_open: bool,
    finish_reason: Option<String>,
}

impl ChatCompletionsDecoder {
    pub fn new(errors: &'static ErrorTable) -> Self {
        Self {
            lines: LineDecoder::new(),
            asm: Assembler::new(),
            errors,
            model_seen: false,
            reasoning_open: false,
            finish_reason: None,
        }
    }

    fn close_reasoning(&mut self) {
        if self.reasoning_open {
            self.reasoning_open = false;
            self.asm.thinking(None, ThinkingPhase::End, "");
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = data_payload(line) else {
            return;
        };
        if data == "[DONE]" {
            self.close_reasoning();
            let finish = self.finish_reason.take();
            self.asm.message_stop(finish.as_deref());
            self.asm.done();
            return;
        }
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(provider = self.errors.provider, error = %e, "skipping malformed chunk");
                return;
            }
        };
        if chunk.error.is_some() {
            let (kind, message) = classify::from_stream(self.errors, data);
            self.asm.error(kind, message);
            return;
        }
        if !self.model_seen {
            if let Some(model) = chunk.model.as_deref().filter(|m| !m.is_empty()) {
                self.model_seen = true;
                self.asm.message_start(model);
            }
        }
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                    if !self.reasoning_open {
                        self.reasoning_open = true;
                        self.asm.thinking(None, ThinkingPhase::Start, "");
                    }
                    self.asm.thinking(None, ThinkingPhase::Delta, &reasoning);
                }
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    self.close_reasoning();
                    self.asm.delta(None, &content);
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        if let Some(usage) = chunk.usage {
            self.asm.usage_report(usage.prompt_tokens, usage.completion_tokens);
        }
    }
}

impl StreamDecoder for ChatCompletionsDecoder {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Vec<EventKind> {
        let mut dec = ChatCompletionsDecoder::new(&OPENAI_ERRORS);
        let mut out = Vec::new();
        for c in chunks {
            out.extend(dec.decode(c.as_bytes()));
        }
        out.extend(dec.finish());
        out
    }

    fn deltas(events: &[EventKind]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::ContentDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_deltas_until_done() {
        let events = decode_all(&[
            "data: {\"model\":\"gpt-4\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3,\"total_tokens\":99}}\n\n",
            "data: [DONE]\n\n",
        ]);
        assert_eq!(events[0], EventKind::ContentStart);
        assert_eq!(events[1], EventKind::MessageStart { model: "gpt-4".into() });
        assert_eq!(deltas(&events), "Hello there!");
        assert!(events.contains(&EventKind::Usage {
            usage: UsageInfo::new(9, 3)
        }));
        assert!(events.contains(&EventKind::MessageStop {
            finish_reason: Some("stop".into())
        }));
        assert_eq!(
            events.last(),
            Some(&EventKind::ContentEnd {
                content: "Hello there!".into()
            })
        );
    }

    #[test]
    fn chunk_split_mid_line() {
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\ndata: [DONE]\n";
        let bytes = full.as_bytes();
        let mut dec = ChatCompletionsDecoder::new(&OPENAI_ERRORS);
        let mut events = Vec::new();
        for b in bytes.chunks(3) {
            events.extend(dec.decode(b));
        }
        events.extend(dec.finish());
        assert_eq!(deltas(&events), "héllo");
        assert!(matches!(events.last(), Some(EventKind::ContentEnd { .. })));
    }

    #[test]
    fn reasoning_content_becomes_thinking() {
        let events = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"answer\"}}]}\n",
            "data: [DONE]\n",
        ]);
        let phases: Vec<ThinkingPhase> = events
            .iter()
            .filter_map(|e| match e {
                EventKind::Thinking { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![ThinkingPhase::Start, ThinkingPhase::Delta, ThinkingPhase::End]
        );
        assert_eq!(deltas(&events), "answer");
    }

    #[test]
    fn missing_done_is_an_error() {
        let events = decode_all(&["data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n"]);
        assert!(matches!(
            events.last(),
            Some(EventKind::Error {
                kind: ErrorKind::ServerError,
                ..
            })
        ));
    }

    #[test]
    fn in_stream_error_is_classified() {
        let events = decode_all(&[
            "data: {\"error\":{\"message\":\"Rate limit reached\",\"type\":\"rate_limit_exceeded\"}}\n",
        ]);
        assert_eq!(
            events.last(),
            Some(&EventKind::Error {
                kind: ErrorKind::RateLimited,
                message: "Rate limit reached".into()
            })
        );
    }

    #[test]
    fn malformed_chunk_is_skipped() {
        let events = decode_all(&[
            "data: {not json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            "data: [DONE]\n",
        ]);
        assert_eq!(deltas(&events), "ok");
    }

    #[test]
    fn requires_api_key() {
        let err = OpenAiProvider::new(OpenAiConfig::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
