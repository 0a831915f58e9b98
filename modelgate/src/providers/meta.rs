//! Meta Llama API. It speaks the OpenAI chat-completions protocol, so this
//! module only supplies endpoints, models and error markers.

use super::openai::{ChatCompletionsDecoder, CompatibleSpec, OpenAiProvider};
use super::owned_models;
use crate::classify::ErrorTable;
use crate::decoder::StreamDecoder;
use crate::error::{ErrorKind, ProviderError};
use crate::retry::RetryConfig;
use crate::transport::{HttpOptions, http_option_setters};
use reqwest::header::HeaderMap;
use serde::Deserialize;

pub const META_BASE_URL: &str = "https://api.llama.com/compat/v1";

pub const META_MODELS: &[&str] = &[
    "Llama-4-Maverick-17B-128E-Instruct-FP8",
    "Llama-4-Scout-17B-16E",
    "Llama-3.3-70B-Instruct",
    "Llama-3.3-8B-Instruct",
];

pub static META_ERRORS: ErrorTable = ErrorTable {
    provider: "meta",
    markers: &[
        ("authentication_error", ErrorKind::Authentication),
        ("permission_error", ErrorKind::Authentication),
        ("insufficient_quota", ErrorKind::RateLimited),
        ("rate_limit_error", ErrorKind::RateLimited),
        ("timeout_error", ErrorKind::Timeout),
        ("not_found_error", ErrorKind::Validation),
        ("invalid_request_error", ErrorKind::Validation),
        ("api_error", ErrorKind::ServerError),
    ],
};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub http: HttpOptions,
}

impl MetaConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads `LLAMA_API_KEY`.
    pub fn from_env() -> Option<Self> {
        std::env::var("LLAMA_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Self::new)
    }
}

http_option_setters!(MetaConfig);

pub type MetaProvider = OpenAiProvider;

pub fn meta_provider(config: MetaConfig) -> Result<MetaProvider, ProviderError> {
    OpenAiProvider::compatible(CompatibleSpec {
        errors: &META_ERRORS,
        api_key: config.api_key,
        base_url: config.base_url.unwrap_or_else(|| META_BASE_URL.to_string()),
        headers: Vec::new(),
        models: owned_models(META_MODELS),
        http: config.http,
        retry: RetryConfig::default(),
        decoder: meta_decoder,
    })
}

fn meta_decoder(_headers: &HeaderMap) -> Box<dyn StreamDecoder> {
    Box::new(ChatCompletionsDecoder::new(&META_ERRORS))
}
