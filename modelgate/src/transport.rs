//! HTTP plumbing shared by every vendor: client construction, request
//! signing, status classification and retries.

use crate::classify::{self, ErrorTable};
use crate::context::CallContext;
use crate::error::ProviderError;
use crate::retry::{RateLimiter, Retrier, RetryConfig};
use crate::sanitize::scrub_secret_patterns;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings common to every provider config.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    /// Whole-request timeout for non-streaming calls. Streams are bounded by
    /// the call context deadline instead.
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryConfig>,
    #[serde(skip)]
    pub client: Option<Client>,
    #[serde(skip)]
    pub limiter: Option<Arc<dyn RateLimiter>>,
}

impl HttpOptions {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Builder setters shared by the vendor configs.
macro_rules! http_option_setters {
    ($config:ty) => {
        impl $config {
            pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
                self.base_url = Some(url.into());
                self
            }

            pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
                self.http.timeout_secs = Some(timeout.as_secs().max(1));
                self
            }

            pub fn with_retry(mut self, retry: $crate::retry::RetryConfig) -> Self {
                self.http.retry = Some(retry);
                self
            }

            pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
                self.http.client = Some(client);
                self
            }

            pub fn with_rate_limiter(
                mut self,
                limiter: std::sync::Arc<dyn $crate::retry::RateLimiter>,
            ) -> Self {
                self.http.limiter = Some(limiter);
                self
            }
        }
    };
}
pub(crate) use http_option_setters;

/// What a SigV4 signer needs to see.
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub body: &'a [u8],
}

/// Produces authentication headers (`Authorization`, `X-Amz-Date`,
/// `X-Amz-Security-Token`, ...) for a request. Called on every attempt, so
/// refreshed credentials are picked up.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, request: &SigningRequest<'_>) -> Result<Vec<(String, String)>, ProviderError>;
}

/// A fully described request, replayable across retries and reconnects.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub streaming: bool,
}

impl RequestSpec {
    pub fn post_json<T: serde::Serialize>(url: String, body: &T) -> Result<Self, ProviderError> {
        Ok(Self {
            method: Method::POST,
            url,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(serde_json::to_vec(body)?),
            streaming: false,
        })
    }

    pub fn get(url: String) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            streaming: false,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

pub struct Transport {
    provider: &'static str,
    client: Client,
    timeout: Duration,
    errors: &'static ErrorTable,
    retrier: Retrier,
    signer: Option<Arc<dyn RequestSigner>>,
    closed: AtomicBool,
}

impl Transport {
    pub fn new(
        errors: &'static ErrorTable,
        http: &HttpOptions,
        default_retry: RetryConfig,
    ) -> Result<Self, ProviderError> {
        let client = match &http.client {
            Some(client) => client.clone(),
            None => Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?,
        };
        let retry = http.retry.clone().unwrap_or(default_retry);
        Ok(Self {
            provider: errors.provider,
            client,
            timeout: http.timeout(),
            errors,
            retrier: Retrier::new(errors.provider, retry).with_limiter(http.limiter.clone()),
            signer: None,
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_signer(mut self, signer: Option<Arc<dyn RequestSigner>>) -> Self {
        self.signer = signer;
        self
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn errors(&self) -> &'static ErrorTable {
        self.errors
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Mark closed. Idempotent; later calls fail with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(provider = self.provider, "provider closed");
        }
    }

    pub fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed {
                provider: self.provider.to_string(),
            });
        }
        Ok(())
    }

    /// One attempt. Non-2xx responses are read and classified.
    pub async fn send_once(&self, spec: &RequestSpec) -> Result<reqwest::Response, ProviderError> {
        self.ensure_open()?;
        let mut req = self.client.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            req = req.header(name, value);
        }
        if let Some(signer) = &self.signer {
            let signing = SigningRequest {
                method: spec.method.as_str(),
                url: &spec.url,
                headers: &spec.headers,
                body: spec.body.as_deref().unwrap_or_default(),
            };
            for (name, value) in signer.sign(&signing).await? {
                req = req.header(name, value);
            }
        }
        if let Some(body) = &spec.body {
            req = req.body(body.clone());
        }
        if !spec.streaming {
            req = req.timeout(self.timeout);
        }

        // Request URLs can carry an API key (Gemini); keep it out of errors.
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.without_url()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = header_str(resp.headers(), RETRY_AFTER.as_str()).map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        let err = classify::from_http(self.errors, status.as_u16(), retry_after.as_deref(), &body);
        debug!(provider = self.provider, status = status.as_u16(), error = %err, "request failed");
        Err(err)
    }

    /// Send with retries governed by `ctx`.
    pub async fn send(&self, ctx: &CallContext, spec: &RequestSpec) -> Result<reqwest::Response, ProviderError> {
        self.retrier
            .run(ctx, |attempt| {
                debug!(provider = self.provider, attempt, url = %scrub_secret_patterns(&spec.url), "sending request");
                self.send_once(spec)
            })
            .await
    }

    /// Send with retries and decode the JSON body. Body read and decode
    /// count as part of the attempt.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        spec: &RequestSpec,
    ) -> Result<T, ProviderError> {
        self.retrier
            .run(ctx, |attempt| async move {
                debug!(provider = self.provider, attempt, url = %scrub_secret_patterns(&spec.url), "sending request");
                let resp = self.send_once(spec).await?;
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::Network(e.without_url()))?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .await
    }
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
