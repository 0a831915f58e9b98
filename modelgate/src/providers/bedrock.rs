//! AWS Bedrock through the Converse API.
//!
//! Requests are authenticated either by an injected [`RequestSigner`]
//! (SigV4) or by a Bedrock API key sent as a bearer token. Streams arrive as
//! `application/vnd.amazon.eventstream` frames; line-delimited JSON with one
//! event per top-level key is accepted as well.

use super::{Provider, owned_models, prepare};
use crate::classify::{self, ErrorTable};
use crate::codec::eventstream::{Frame, FrameDecoder, FrameError};
use crate::codec::ndjson::{LineDecoder, data_payload};
use crate::context::CallContext;
use crate::decoder::{Assembler, StreamDecoder};
use crate::error::{ErrorKind, ProviderError};
use crate::options::{ChatOptions, ChatRequest};
use crate::retry::RetryConfig;
use crate::sigv4::{BEDROCK_SERVICE, Credentials, SigV4Signer};
use crate::stream::{self, EventStream};
use crate::transport::{
    HttpOptions, RequestSigner, RequestSpec, Transport, header_str, http_option_setters,
};
use crate::types::{EventKind, Message, Response, ThinkingPhase, UsageInfo};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

pub const BEDROCK_DEFAULT_REGION: &str = "us-east-1";
const EVENTSTREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

pub const BEDROCK_MODELS: &[&str] = &[
    "anthropic.claude-3-5-sonnet-20241022-v2:0",
    "anthropic.claude-3-opus-20240229-v1:0",
    "anthropic.claude-3-sonnet-20240229-v1:0",
    "anthropic.claude-3-haiku-20240307-v1:0",
    "anthropic.claude-v2",
    "anthropic.claude-instant-v1",
];

pub static BEDROCK_ERRORS: ErrorTable = ErrorTable {
    provider: "bedrock",
    markers: &[
        ("exceeds maximum", ErrorKind::ContextLengthExceeded),
        ("input is too long", ErrorKind::ContextLengthExceeded),
        ("accessdenied", ErrorKind::Authentication),
        ("access denied", ErrorKind::Authentication),
        ("security token", ErrorKind::Authentication),
        ("unrecognizedclient", ErrorKind::Authentication),
        ("credentials", ErrorKind::Authentication),
        ("expiredtoken", ErrorKind::Authentication),
        ("throttl", ErrorKind::RateLimited),
        ("rate exceed", ErrorKind::RateLimited),
        ("servicequotaexceeded", ErrorKind::RateLimited),
        ("modeltimeout", ErrorKind::Timeout),
        ("modelstreamerror", ErrorKind::ServerError),
        ("internalserver", ErrorKind::ServerError),
        ("serviceunavailable", ErrorKind::ServerError),
        ("modelnotready", ErrorKind::ServerError),
        ("validationexception", ErrorKind::Validation),
        ("resourcenotfound", ErrorKind::Validation),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct BedrockConfig {
    pub region: String,
    /// Named AWS profile. Without an API key or explicit signer, credentials
    /// are resolved from this profile through the default AWS chain.
    pub profile: Option<String>,
    /// Bedrock API key, sent as `Authorization: Bearer`.
    pub api_key: Option<String>,
    /// Overrides `https://bedrock-runtime.{region}.amazonaws.com`.
    pub base_url: Option<String>,
    #[serde(skip)]
    pub signer: Option<Arc<dyn RequestSigner>>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl BedrockConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sign with fixed credentials for this config's region.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        let region = self.region_or_default().to_string();
        self.with_signer(Arc::new(SigV4Signer::new(credentials, region, BEDROCK_SERVICE)))
    }

    /// `AWS_REGION` (or `AWS_DEFAULT_REGION`) plus either
    /// `AWS_BEARER_TOKEN_BEDROCK`, or `AWS_ACCESS_KEY_ID` / `AWS_PROFILE`
    /// for the default credential chain. `None` when none of these is set.
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let region = var("AWS_REGION")
            .or_else(|| var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| BEDROCK_DEFAULT_REGION.to_string());
        let mut config = Self::new(region);
        config.profile = var("AWS_PROFILE");
        if let Some(token) = var("AWS_BEARER_TOKEN_BEDROCK") {
            return Some(config.with_api_key(token));
        }
        if config.profile.is_none() && var("AWS_ACCESS_KEY_ID").is_none() {
            return None;
        }
        let region = config.region_or_default().to_string();
        let signer = SigV4Signer::from_default_chain(region, BEDROCK_SERVICE, config.profile.clone());
        Some(config.with_signer(Arc::new(signer)))
    }

    fn region_or_default(&self) -> &str {
        if self.region.is_empty() {
            BEDROCK_DEFAULT_REGION
        } else {
            &self.region
        }
    }
}

http_option_setters!(BedrockConfig);

pub struct BedrockProvider {
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    transport: Arc<Transport>,
}

impl BedrockProvider {
    pub fn new(config: BedrockConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().filter(|k| !k.is_empty());
        let region = config.region_or_default().to_string();
        let signer: Option<Arc<dyn RequestSigner>> = match (&config.signer, &config.profile) {
            (Some(signer), _) => Some(signer.clone()),
            (None, Some(profile)) => Some(Arc::new(SigV4Signer::from_default_chain(
                region.clone(),
                BEDROCK_SERVICE,
                Some(profile.clone()),
            ))),
            (None, None) => None,
        };
        if api_key.is_none() && signer.is_none() {
            return Err(ProviderError::api(
                BEDROCK_ERRORS.provider,
                ErrorKind::Authentication,
                "AWS credentials are required: configure a profile, a request signer or a Bedrock API key",
            ));
        }
        debug!(%region, profile = ?config.profile, bearer = api_key.is_some(), "configuring bedrock");
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        // A bearer key replaces SigV4 entirely.
        let signer = if api_key.is_some() { None } else { signer };
        let transport = Transport::new(&BEDROCK_ERRORS, &config.http, RetryConfig::default())?
            .with_signer(signer);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models: owned_models(BEDROCK_MODELS),
            transport: Arc::new(transport),
        })
    }

    fn build(&self, req: &ChatRequest, stream: bool) -> Result<RequestSpec, ProviderError> {
        let system = req.system_text();
        let body = ConverseRequest {
            messages: req
                .conversation()
                .map(|m| ConverseMessage {
                    role: m.role.as_str(),
                    content: vec![TextBlock { text: &m.content }],
                })
                .collect(),
            system: system.as_deref().map(|text| vec![TextBlock { text }]),
            inference_config: InferenceConfig {
                max_tokens: req.max_tokens,
                temperature: req.temperature,
                top_p: req.top_p_override(),
                stop_sequences: &req.stop_sequences,
            },
        };
        // Model ids contain ':'; keep it percent-encoded so the signed path
        // matches what is sent.
        let model: String = url::form_urlencoded::byte_serialize(req.model.as_bytes()).collect();
        let action = if stream { "converse-stream" } else { "converse" };
        let mut spec =
            RequestSpec::post_json(format!("{}/model/{model}/{action}", self.base_url), &body)?;
        if let Some(key) = &self.api_key {
            spec = spec.header("Authorization", format!("Bearer {key}"));
        }
        Ok(if stream {
            spec.header("Accept", EVENTSTREAM_CONTENT_TYPE).streaming()
        } else {
            spec.header("Accept", "application/json")
        })
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        BEDROCK_ERRORS.provider
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
        let resp: ConverseResponse = self
            .transport
            .send_json(ctx, &spec)
            .await
            .map_err(annotate_context_length)?;

        let mut content = String::new();
        let mut reasoning = String::new();
        for block in resp.output.message.content {
            if let Some(text) = block.text {
                content.push_str(&text);
            }
            if let Some(r) = block.reasoning_content.and_then(|r| r.reasoning_text) {
                reasoning.push_str(&r.text);
            }
        }
        let usage = resp
            .usage
            .map(|u| UsageInfo::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();
        Ok(Response {
            content,
            model: req.model,
            provider: BEDROCK_ERRORS.provider.to_string(),
            finish_reason: resp.stop_reason,
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
        let response = self
            .transport
            .send(ctx, &spec)
            .await
            .map_err(annotate_context_length)?;
        Ok(stream::spawn(
            ctx.clone(),
            self.transport.clone(),
            spec,
            response,
            bedrock_decoder,
        ))
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.transport.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Context-length details
// ---------------------------------------------------------------------------

static HAS_SUPPORTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"has (\d+) tokens.*?supports (\d+)").unwrap());
static REQUESTED_MAXIMUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"requested (\d+).*?maximum (\d+)").unwrap());
static TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) tokens").unwrap());

/// `(requested, maximum)` token counts from a context-length message.
/// Zero means the message did not say.
pub fn context_length_tokens(message: &str) -> (u64, u64) {
    let number = |caps: &regex::Captures<'_>, i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    if let Some(caps) = HAS_SUPPORTS_RE
        .captures(message)
        .or_else(|| REQUESTED_MAXIMUM_RE.captures(message))
    {
        return (number(&caps, 1), number(&caps, 2));
    }
    if let Some(caps) = TOKENS_RE.captures(message) {
        return (number(&caps, 1), 0);
    }
    (0, 0)
}

fn annotate_context_length(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Api {
            provider,
            kind: ErrorKind::ContextLengthExceeded,
            status,
            message,
            retry_after,
        } => {
            let message = match context_length_tokens(&message) {
                (0, _) => message,
                (requested, 0) => format!("{message} (requested {requested} tokens)"),
                (requested, max) => {
                    format!("{message} (requested {requested} tokens, maximum {max})")
                }
            };
            ProviderError::Api {
                provider,
                kind: ErrorKind::ContextLengthExceeded,
                status,
                message,
                retry_after,
            }
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest<'a> {
    messages: Vec<ConverseMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<TextBlock<'a>>>,
    inference_config: InferenceConfig<'a>,
}

#[derive(Serialize)]
struct ConverseMessage<'a> {
    role: &'a str,
    content: Vec<TextBlock<'a>>,
}

#[derive(Serialize)]
struct TextBlock<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig<'a> {
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ConverseOutput {
    message: OutputMessage,
}

#[derive(Deserialize)]
struct OutputMessage {
    #[serde(default)]
    content: Vec<OutputBlock>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reasoning_content: Option<ReasoningBlock>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReasoningBlock {
    #[serde(default)]
    reasoning_text: Option<ReasoningText>,
}

#[derive(Deserialize)]
struct ReasoningText {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StreamPayload {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content_block_index: Option<usize>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reasoning_content: Option<ReasoningDelta>,
}

#[derive(Deserialize)]
struct ReasoningDelta {
    #[serde(default)]
    text: Option<String>,
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

fn bedrock_decoder(headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    let framed = header_str(headers, CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with(EVENTSTREAM_CONTENT_TYPE));
    Box::new(if framed {
        ConverseStreamDecoder::framed()
    } else {
        ConverseStreamDecoder::lines()
    })
}

enum Framing {
    EventStream(FrameDecoder),
    Lines(LineDecoder),
}

/// Decoder for `converse-stream`.
///
/// `messageStop` ends the turn, but the `metadata` event carrying usage
/// follows it, so completion is deferred until metadata or end of input.
pub struct ConverseStreamDecoder {
    framing: Framing,
    asm: Assembler,
    reasoning: Option<usize>,
    stopped: Option<Option<String>>,
}

impl ConverseStreamDecoder {
    pub fn framed() -> Self {
        Self::with(Framing::EventStream(FrameDecoder::new()))
    }

    pub fn lines() -> Self {
        Self::with(Framing::Lines(LineDecoder::new()))
    }

    fn with(framing: Framing) -> Self {
        Self {
            framing,
            asm: Assembler::new(),
            reasoning: None,
            stopped: None,
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let message_type = frame.header_str(":message-type").unwrap_or("event");
        let payload = String::from_utf8_lossy(&frame.payload);
        match message_type {
            "event" => {
                let Some(event_type) = frame.header_str(":event-type") else {
                    debug!("skipping eventstream frame without :event-type");
                    return;
                };
                let event_type = event_type.to_string();
                self.handle_payload(&event_type, &payload);
            }
            "exception" => {
                let exception = frame.header_str(":exception-type").unwrap_or("exception");
                self.fail(exception, &payload);
            }
            "error" => {
                let code = frame.header_str(":error-code").unwrap_or("error").to_string();
                let message = frame.header_str(":error-message").unwrap_or_default().to_string();
                self.fail(&code, &message);
            }
            other => debug!(message_type = other, "ignoring eventstream frame"),
        }
    }

    /// A JSON line keyed by event name, e.g. `{"contentBlockDelta": {...}}`.
    fn handle_line(&mut self, line: &str) {
        let line = data_payload(line).unwrap_or(line);
        let object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "skipping malformed bedrock line");
                return;
            }
        };
        for (key, value) in object {
            if key.ends_with("Exception") || key == "error" {
                let payload = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.fail(&key, &payload);
            } else {
                self.handle_payload(&key, &value.to_string());
            }
        }
    }

    fn handle_payload(&mut self, event_type: &str, payload: &str) {
        let data: StreamPayload = match serde_json::from_str(payload) {
            Ok(data) => data,
            Err(e) => {
                debug!(event_type, error = %e, "skipping malformed bedrock event");
                return;
            }
        };
        match event_type {
            "messageStart" => {
                debug!(role = ?data.role, "bedrock message start");
                self.asm.message_start("");
            }
            "contentBlockStart" => {}
            "contentBlockDelta" => {
                let Some(delta) = data.delta else { return };
                let index = data.content_block_index;
                if let Some(text) = delta.reasoning_content.and_then(|r| r.text) {
                    if self.reasoning.is_none() {
                        self.reasoning = Some(index.unwrap_or(0));
                        self.asm.thinking(index, ThinkingPhase::Start, "");
                    }
                    self.asm.thinking(index, ThinkingPhase::Delta, &text);
                }
                if let Some(text) = delta.text {
                    self.asm.delta(index, &text);
                }
            }
            "contentBlockStop" => {
                let Some(index) = data.content_block_index else { return };
                if self.reasoning == Some(index) {
                    self.reasoning = None;
                    self.asm.thinking(Some(index), ThinkingPhase::End, "");
                }
                self.asm.block_stop(index);
            }
            "messageStop" => {
                self.stopped = Some(data.stop_reason);
            }
            "metadata" => {
                if let Some(usage) = data.usage {
                    self.asm.usage_report(usage.input_tokens, usage.output_tokens);
                }
                self.complete();
            }
            other => debug!(event_type = other, "ignoring bedrock event"),
        }
    }

    fn complete(&mut self) {
        if let Some(reason) = self.stopped.take() {
            self.asm.message_stop(reason.as_deref());
            self.asm.done();
        }
    }

    fn fail(&mut self, exception: &str, payload: &str) {
        let kind = classify::classify(&BEDROCK_ERRORS, None, &format!("{exception}: {payload}"));
        let mut message = classify::extract_message(payload);
        if message.is_empty() {
            message = exception.to_string();
        }
        let err = annotate_context_length(ProviderError::api(BEDROCK_ERRORS.provider, kind, message));
        self.asm.error(kind, err.message());
    }

    fn push(&mut self, chunk: &[u8]) {
        match &mut self.framing {
            Framing::EventStream(frames) => frames.push(chunk),
            Framing::Lines(_) => {}
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match &mut self.framing {
            Framing::EventStream(frames) => frames.next_frame(),
            Framing::Lines(_) => Ok(None),
        }
    }
}

impl StreamDecoder for ConverseStreamDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Vec<EventKind> {
        if self.asm.is_finished() {
            return self.asm.drain();
        }
        if let Framing::Lines(lines) = &mut self.framing {
            let lines = lines.feed(chunk);
            for line in lines {
                self.handle_line(&line);
            }
            return self.asm.drain();
        }

        self.push(chunk);
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "corrupt eventstream frame");
                    self.asm
                        .error(ErrorKind::ServerError, format!("invalid event stream frame: {e}"));
                    break;
                }
            }
        }
        self.asm.drain()
    }

    fn finish(&mut self) -> Vec<EventKind> {
        let trailing = match &mut self.framing {
            Framing::EventStream(frames) => {
                let pending = frames.pending();
                if pending > 0 && !self.asm.is_finished() {
                    warn!(pending, "eventstream ended mid-frame");
                }
                None
            }
            Framing::Lines(lines) => lines.finish(),
        };
        if let Some(line) = trailing {
            self.handle_line(&line);
        }
        self.complete();
        self.asm.eof();
        self.asm.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::eventstream::encode_frame;

    fn event_frame(event_type: &str, payload: &str) -> Vec<u8> {
        encode_frame(
            &[
                (":event-type", event_type),
                (":content-type", "application/json"),
                (":message-type", "event"),
            ],
            payload.as_bytes(),
        )
    }

    fn transcript() -> Vec<u8> {
        [
            event_frame("messageStart", r#"{"role":"assistant"}"#),
            event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"Hello"}}"#),
            event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":" from"}}"#),
            event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":" Bedrock"}}"#),
            event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"!"}}"#),
            event_frame("contentBlockStop", r#"{"contentBlockIndex":0}"#),
            event_frame("messageStop", r#"{"stopReason":"end_turn"}"#),
            event_frame("metadata", r#"{"usage":{"inputTokens":12,"outputTokens":4,"totalTokens":16},"metrics":{"latencyMs":100}}"#),
        ]
        .concat()
    }

    fn deltas(events: &[EventKind]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                EventKind::ContentDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn frames_split_at_every_byte() {
        let bytes = transcript();
        let mut dec = ConverseStreamDecoder::framed();
        let mut events = Vec::new();
        for b in bytes.chunks(1) {
            events.extend(dec.decode(b));
        }
        events.extend(dec.finish());
        assert_eq!(deltas(&events), vec!["Hello", " from", " Bedrock", "!"]);
        assert!(events.contains(&EventKind::Usage {
            usage: UsageInfo::new(12, 4)
        }));
        assert!(events.contains(&EventKind::MessageStop {
            finish_reason: Some("end_turn".into())
        }));
        assert_eq!(
            events.last(),
            Some(&EventKind::ContentEnd {
                content: "Hello from Bedrock!".into()
            })
        );
    }

    #[test]
    fn message_stop_without_metadata_completes_at_eof() {
        let bytes = [
            event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"ok"}}"#),
            event_frame("messageStop", r#"{"stopReason":"end_turn"}"#),
        ]
        .concat();
        let mut dec = ConverseStreamDecoder::framed();
        let mut events = dec.decode(&bytes);
        assert!(!events.iter().any(|e| matches!(e, EventKind::ContentEnd { .. })));
        events.extend(dec.finish());
        assert_eq!(
            events.last(),
            Some(&EventKind::ContentEnd { content: "ok".into() })
        );
    }

    #[test]
    fn exception_frame_is_classified() {
        let frame = encode_frame(
            &[
                (":exception-type", "throttlingException"),
                (":message-type", "exception"),
            ],
            br#"{"message":"Rate exceeded, slow down"}"#,
        );
        let mut dec = ConverseStreamDecoder::framed();
        let mut events = dec.decode(&frame);
        events.extend(dec.finish());
        assert_eq!(
            events,
            vec![EventKind::Error {
                kind: ErrorKind::RateLimited,
                message: "Rate exceeded, slow down".into()
            }]
        );
    }

    #[test]
    fn corrupt_frame_is_a_server_error() {
        let mut bytes = event_frame("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"x"}}"#);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut dec = ConverseStreamDecoder::framed();
        let mut events = dec.decode(&bytes);
        events.extend(dec.finish());
        assert!(matches!(
            events.as_slice(),
            [EventKind::Error {
                kind: ErrorKind::ServerError,
                ..
            }]
        ));
    }

    #[test]
    fn keyed_json_lines() {
        let input = concat!(
            "{\"messageStart\":{\"role\":\"assistant\"}}\n",
            "{\"contentBlockDelta\":{\"contentBlockIndex\":0,\"delta\":{\"reasoningContent\":{\"text\":\"hmm\"}}}}\n",
            "{\"contentBlockStop\":{\"contentBlockIndex\":0}}\n",
            "{\"contentBlockDelta\":{\"contentBlockIndex\":1,\"delta\":{\"text\":\"Hi\"}}}\n",
            "{\"messageStop\":{\"stopReason\":\"end_turn\"}}\n",
            "{\"metadata\":{\"usage\":{\"inputTokens\":3,\"outputTokens\":1}}}\n",
        );
        let mut dec = ConverseStreamDecoder::lines();
        let mut events = dec.decode(input.as_bytes());
        events.extend(dec.finish());
        let thinking = events
            .iter()
            .filter(|e| matches!(e, EventKind::Thinking { .. }))
            .count();
        assert_eq!(thinking, 3);
        assert_eq!(
            events.last(),
            Some(&EventKind::ContentEnd { content: "Hi".into() })
        );
    }

    #[test]
    fn context_length_numbers() {
        assert_eq!(
            context_length_tokens("prompt has 250000 tokens but the model only supports 200000"),
            (250000, 200000)
        );
        assert_eq!(
            context_length_tokens("requested 9000 tokens, maximum 8192"),
            (9000, 8192)
        );
        assert_eq!(context_length_tokens("input of 5000 tokens is too long"), (5000, 0));
        assert_eq!(context_length_tokens("no numbers here"), (0, 0));

        let err = annotate_context_length(ProviderError::api(
            "bedrock",
            ErrorKind::ContextLengthExceeded,
            "Input is too long: has 300 tokens, model supports 200",
        ));
        assert_eq!(
            err.message(),
            "Input is too long: has 300 tokens, model supports 200 (requested 300 tokens, maximum 200)"
        );
    }

    #[test]
    fn requires_credentials() {
        let err = BedrockProvider::new(BedrockConfig::new("us-east-1")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(BedrockProvider::new(BedrockConfig::new("us-east-1").with_api_key("k")).is_ok());
    }

    #[test]
    fn profile_alone_configures_signing() {
        // The credential chain is only consulted on the first request.
        assert!(BedrockProvider::new(BedrockConfig::new("us-east-1").with_profile("dev")).is_ok());
    }

    #[test]
    fn converse_url_encodes_model_id() {
        let provider = BedrockProvider::new(BedrockConfig::new("eu-west-1").with_api_key("k")).unwrap();
        let req = ChatOptions::new()
            .with_model("anthropic.claude-3-haiku-20240307-v1:0")
            .into_request(&[Message::user("hi")])
            .unwrap();
        let spec = provider.build(&req, true).unwrap();
        assert_eq!(
            spec.url,
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/anthropic.claude-3-haiku-20240307-v1%3A0/converse-stream"
        );
        assert!(spec.headers.contains(&("Authorization".into(), "Bearer k".into())));
    }
}
