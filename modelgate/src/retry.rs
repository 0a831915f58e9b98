//! Retry logic for provider calls: exponential backoff with jitter, vendor
//! `Retry-After` handling and an optional rate-limiter gate.

use crate::context::CallContext;
use crate::error::{ErrorKind, ProviderError};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Relative jitter: 0.1 spreads each delay over ±10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Outcome of asking the rate limiter for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn deny(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// External admission control, consulted before every attempt.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, key: &str) -> RateDecision;
}

/// Delay before retry number `attempt + 1`: `base * 2^attempt` with jitter,
/// capped at `max_backoff_ms`. A vendor `Retry-After` replaces the computed
/// value (still bounded by the cap).
pub fn compute_backoff(config: &RetryConfig, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let cap = Duration::from_millis(config.max_backoff_ms);
    if let Some(retry_after) = retry_after {
        return retry_after.min(cap);
    }
    let exp = config
        .base_backoff_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let mut delay_ms = exp.min(config.max_backoff_ms) as f64;
    if config.jitter > 0.0 {
        let j = config.jitter.min(1.0);
        delay_ms *= rand::rng().random_range((1.0 - j)..=(1.0 + j));
    }
    Duration::from_millis(delay_ms as u64).min(cap)
}

/// Runs one logical call with retries.
#[derive(Clone)]
pub struct Retrier {
    provider: &'static str,
    config: RetryConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl Retrier {
    pub fn new(provider: &'static str, config: RetryConfig) -> Self {
        Self {
            provider,
            config,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    async fn admit(&self) -> Result<(), ProviderError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let decision = limiter.allow(self.provider).await;
        if decision.allowed {
            return Ok(());
        }
        warn!(provider = self.provider, retry_after = ?decision.retry_after, "rate limiter denied request");
        Err(ProviderError::Api {
            provider: self.provider.to_string(),
            kind: ErrorKind::RateLimited,
            status: None,
            message: "local rate limit reached".into(),
            retry_after: decision.retry_after,
        })
    }

    /// Call `op(attempt)` until it succeeds, fails with a terminal kind, or
    /// attempts run out. Cancellation and the deadline abort both the
    /// in-flight attempt and any backoff sleep.
    pub async fn run<T, F, Fut>(&self, ctx: &CallContext, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            if ctx.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let result = match self.admit().await {
                Ok(()) => ctx.run(op(attempt)).await,
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= self.config.max_retries {
                if attempt > 0 {
                    warn!(provider = self.provider, attempts = attempt + 1, error = %err, "giving up");
                }
                return Err(err);
            }
            let delay = compute_backoff(&self.config, attempt, err.retry_after());
            debug!(
                provider = self.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                "retrying"
            );
            ctx.sleep(delay).await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: 0.0,
        }
    }

    fn api_err(kind: ErrorKind) -> ProviderError {
        ProviderError::api("test", kind, "boom")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = no_jitter();
        assert_eq!(compute_backoff(&config, 0, None), Duration::from_millis(100));
        assert_eq!(compute_backoff(&config, 1, None), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 3, None), Duration::from_millis(800));
        assert_eq!(compute_backoff(&config, 4, None), Duration::from_millis(1_000));
        assert_eq!(compute_backoff(&config, 70, None), Duration::from_millis(1_000));
    }

    #[test]
    fn retry_after_wins() {
        let config = no_jitter();
        assert_eq!(
            compute_backoff(&config, 0, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            compute_backoff(&config, 3, Some(Duration::from_millis(5))),
            Duration::from_millis(5)
        );
        assert_eq!(
            compute_backoff(&config, 0, Some(Duration::from_secs(120))),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = RetryConfig {
            jitter: 0.1,
            ..no_jitter()
        };
        for _ in 0..50 {
            let d = compute_backoff(&config, 1, None).as_millis();
            assert!((180..=220).contains(&d), "{d}ms out of band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_until_limit() {
        let retrier = Retrier::new("test", no_jitter());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retrier
            .run(&CallContext::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(api_err(ErrorKind::ServerError)) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ServerError);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let retrier = Retrier::new("test", no_jitter());
        for kind in [ErrorKind::Authentication, ErrorKind::Validation, ErrorKind::ContentBlocked] {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = retrier
                .run(&CallContext::new(), |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(api_err(kind)) }
                })
                .await;
            assert_eq!(result.unwrap_err().kind(), kind);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let retrier = Retrier::new("test", no_jitter());
        let value = retrier
            .run(&CallContext::new(), |attempt| async move {
                if attempt < 2 {
                    Err(api_err(ErrorKind::RateLimited))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let retrier = Retrier::new(
            "test",
            RetryConfig {
                base_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                ..no_jitter()
            },
        );
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result: Result<(), _> = retrier
            .run(&ctx, |_| async { Err(api_err(ErrorKind::ServerError)) })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    struct DenyFirst(AtomicU32);

    #[async_trait]
    impl RateLimiter for DenyFirst {
        async fn allow(&self, _key: &str) -> RateDecision {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                RateDecision::deny(Some(Duration::from_millis(10)))
            } else {
                RateDecision::allow()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_denial_is_rate_limited() {
        let limiter = Arc::new(DenyFirst(AtomicU32::new(0)));
        let retrier = Retrier::new("test", no_jitter()).with_limiter(Some(limiter.clone()));
        let calls = AtomicU32::new(0);
        retrier
            .run(&CallContext::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.0.load(Ordering::SeqCst), 2);

        let strict = Retrier::new("test", RetryConfig::none())
            .with_limiter(Some(Arc::new(DenyFirst(AtomicU32::new(0)))));
        let err = strict
            .run(&CallContext::new(), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(10)));
    }
}
