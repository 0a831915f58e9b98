//! Google Gemini (Generative Language API, API-key auth).

use super::{Provider, owned_models, prepare};
use crate::classify::{self, ErrorTable};
use crate::codec::ndjson::{LineDecoder, data_payload};
use crate::context::CallContext;
use crate::decoder::{Assembler, StreamDecoder};
use crate::error::{ErrorKind, ProviderError};
use crate::options::{ChatOptions, ChatRequest};
use crate::retry::RetryConfig;
use crate::stream::{self, EventStream};
use crate::transport::{HttpOptions, RequestSpec, Transport, http_option_setters};
use crate::types::{EventKind, Message, Response, Role, ThinkingPhase, UsageInfo};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const GEMINI_MODELS: &[&str] = &[
    "gemini-pro",
    "gemini-pro-vision",
    "gemini-ultra",
    "gemini-1.5-pro",
    "gemini-1.5-pro-latest",
    "gemini-1.5-flash",
    "gemini-1.5-flash-latest",
];

pub static GEMINI_ERRORS: ErrorTable = ErrorTable {
    provider: "gemini",
    markers: &[
        ("api key not valid", ErrorKind::Authentication),
        ("api_key_invalid", ErrorKind::Authentication),
        ("permission_denied", ErrorKind::Authentication),
        ("resource_exhausted", ErrorKind::RateLimited),
        ("quota", ErrorKind::RateLimited),
        ("deadline_exceeded", ErrorKind::Timeout),
        ("blocked", ErrorKind::ContentBlocked),
        ("safety", ErrorKind::ContentBlocked),
        ("invalid_argument", ErrorKind::Validation),
        ("unavailable", ErrorKind::ServerError),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads `GEMINI_API_KEY`, falling back to `GOOGLE_API_KEY`.
    pub fn from_env() -> Option<Self> {
        ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|k| !k.is_empty())
            .map(Self::new)
    }
}

http_option_setters!(GeminiConfig);

pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    models: Vec<String>,
    transport: Arc<Transport>,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::api(
                GEMINI_ERRORS.provider,
                ErrorKind::Authentication,
                "API key is required",
            ));
        }
        let transport = Transport::new(&GEMINI_ERRORS, &config.http, RetryConfig::default())?;
        Ok(Self {
            base_url: config
                .base_url
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key,
            models: owned_models(GEMINI_MODELS),
            transport: Arc::new(transport),
        })
    }

    /// `{base}/models/{model}:{method}?key=...`, plus `alt=sse` when streaming.
    fn endpoint(&self, model: &str, stream: bool) -> Result<String, ProviderError> {
        let method = if stream { "streamGenerateContent" } else { "generateContent" };
        let mut url = Url::parse(&format!("{}/models/{model}:{method}", self.base_url))
            .map_err(|e| ProviderError::InvalidOption(format!("invalid gemini base url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if stream {
                query.append_pair("alt", "sse");
            }
            query.append_pair("key", &self.api_key);
        }
        Ok(url.into())
    }

    fn build(&self, req: &ChatRequest, stream: bool) -> Result<RequestSpec, ProviderError> {
        let contents = req
            .conversation()
            .map(|m| Content {
                role: match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                parts: vec![TextPart { text: &m.content }],
            })
            .collect();
        let system = req.system_text();
        let body = GenerateContentRequest {
            contents,
            system_instruction: system.as_deref().map(|text| SystemInstruction {
                parts: vec![TextPart { text }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: req.max_tokens,
                temperature: req.temperature,
                top_p: req.top_p_override(),
                top_k: req.metadata.get("topK").and_then(|k| k.parse().ok()).filter(|k| *k > 0),
                stop_sequences: &req.stop_sequences,
            },
        };
        let spec = RequestSpec::post_json(self.endpoint(&req.model, stream)?, &body)?;
        Ok(if stream { spec.streaming() } else { spec })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        GEMINI_ERRORS.provider
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
        let resp: GenerateContentResponse = self.transport.send_json(ctx, &spec).await?;

        if let Some(reason) = resp.block_reason() {
            return Err(ProviderError::api(
                GEMINI_ERRORS.provider,
                ErrorKind::ContentBlocked,
                format!("prompt blocked: {reason}"),
            ));
        }
        let candidate = resp.candidates.into_iter().next().ok_or_else(|| {
            ProviderError::api(
                GEMINI_ERRORS.provider,
                ErrorKind::ServerError,
                "response contained no candidates",
            )
        })?;
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(ProviderError::api(
                GEMINI_ERRORS.provider,
                ErrorKind::ContentBlocked,
                "response blocked due to safety settings",
            ));
        }

        let mut content = String::new();
        let mut reasoning = String::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            let text = part.text.unwrap_or_default();
            if part.thought {
                reasoning.push_str(&text);
            } else {
                content.push_str(&text);
            }
        }
        let usage = resp
            .usage_metadata
            .map(|u| UsageInfo::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();
        Ok(Response {
            content,
            model: resp.model_version.unwrap_or(req.model),
            provider: GEMINI_ERRORS.provider.to_string(),
            finish_reason: candidate.finish_reason,
            usage,
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
            gemini_decoder,
        ))
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.transport.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    max_output_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

// ---------------------------------------------------------------------------
// Response types (shared by generateContent and each streamed chunk)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

impl GenerateContentResponse {
    /// Set only when the prompt itself was rejected and nothing was generated.
    fn block_reason(&self) -> Option<&str> {
        if !self.candidates.is_empty() {
            return None;
        }
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
            .filter(|r| !r.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

fn gemini_decoder(_headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    Box::new(GeminiStreamDecoder::default())
}

/// `alt=sse` chunks. There is no end sentinel: the chunk carrying a
/// `finishReason` ends the stream.
#[derive(Default)]
pub struct GeminiStreamDecoder {
    lines: LineDecoder,
    asm: Assembler,
    model_seen: bool,
    in_thought: bool,
}

impl GeminiStreamDecoder {
    fn end_thought(&mut self) {
        if self.in_thought {
            self.in_thought = false;
            self.asm.thinking(None, ThinkingPhase::End, "");
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(data) = data_payload(line) else {
            return;
        };
        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "skipping malformed gemini chunk");
                return;
            }
        };
        if value.get("error").is_some() {
            let (kind, message) = classify::from_stream(&GEMINI_ERRORS, data);
            self.asm.error(kind, message);
            return;
        }
        let chunk: GenerateContentResponse = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping unexpected gemini chunk");
                return;
            }
        };
        if let Some(reason) = chunk.block_reason() {
            self.asm
                .error(ErrorKind::ContentBlocked, format!("prompt blocked: {reason}"));
            return;
        }
        if !self.model_seen {
            if let Some(model) = chunk.model_version.as_deref() {
                self.model_seen = true;
                self.asm.message_start(model);
            }
        }

        let mut finish_reason = None;
        if let Some(candidate) = chunk.candidates.into_iter().next() {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                let Some(text) = part.text else { continue };
                if part.thought {
                    if !self.in_thought {
                        self.in_thought = true;
                        self.asm.thinking(None, ThinkingPhase::Start, "");
                    }
                    self.asm.thinking(None, ThinkingPhase::Delta, &text);
                } else {
                    self.end_thought();
                    self.asm.delta(None, &text);
                }
            }
            finish_reason = candidate.finish_reason;
        }
        if let Some(usage) = chunk.usage_metadata {
            self.asm
                .usage_report(usage.prompt_token_count, usage.candidates_token_count);
        }

        match finish_reason.as_deref() {
            None | Some("") | Some("FINISH_REASON_UNSPECIFIED") => {}
            Some("SAFETY") => {
                self.asm.error(
                    ErrorKind::ContentBlocked,
                    "response blocked due to safety settings",
                );
            }
            Some(reason) => {
                self.end_thought();
                self.asm.message_stop(Some(reason));
                self.asm.done();
            }
        }
    }
}

impl StreamDecoder for GeminiStreamDecoder {
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
