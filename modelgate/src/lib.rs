pub mod catalog;
pub mod classify;
pub mod codec;
pub mod config;
pub mod context;
pub mod decoder;
pub mod error;
pub mod options;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod sigv4;
pub mod stream;
pub mod thinking;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, ProvidersConfig};
pub use context::CallContext;
pub use error::{ErrorKind, ProviderError};
pub use options::{ChatOptions, ChatRequest};
pub use providers::{Provider, validate_model};
pub use registry::{ProviderRegistry, RegistryError};
pub use retry::{RateDecision, RateLimiter, RetryConfig};
pub use stream::EventStream;
pub use thinking::{ThinkingDisplay, ThinkingError, ThinkingTracker};
pub use transport::{RequestSigner, SigningRequest};
pub use types::*;
