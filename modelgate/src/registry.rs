//! Named collection of providers, owned by the application and passed to
//! whatever needs to look providers up.

use crate::providers::Provider;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("provider {0:?} not found")]
    NotFound(String),
    #[error("provider name must not be empty")]
    EmptyName,
    #[error("registry is closed")]
    Closed,
    #[error("failed to close {} provider(s): {}", .0.len(), .0.join("; "))]
    CloseFailed(Vec<String>),
}

#[derive(Default)]
struct Inner {
    providers: HashMap<String, Arc<dyn Provider>>,
    closed: bool,
}

/// Read-mostly: lookups share a read lock, registration and close take the
/// write lock.
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves the map consistent, so poisoning
    // is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, name: &str, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut inner = self.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if inner.providers.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        inner.providers.insert(name.to_string(), provider);
        debug!(provider = name, "registered provider");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let inner = self.read();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        inner
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().providers.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.read().providers.len()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove and return a provider without closing it.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.write()
            .providers
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Close every provider and empty the registry. Failures are collected
    /// rather than stopping at the first. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), RegistryError> {
        let providers: Vec<(String, Arc<dyn Provider>)> = {
            let mut inner = self.write();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.providers.drain().collect()
        };

        let mut failures = Vec::new();
        for (name, provider) in providers {
            if let Err(e) = provider.close() {
                warn!(provider = %name, error = %e, "failed to close provider");
                failures.push(format!("{name}: {e}"));
            }
        }
        failures.sort();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::CloseFailed(failures))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CallContext;
    use crate::error::{ErrorKind, ProviderError};
    use crate::options::ChatOptions;
    use crate::stream::EventStream;
    use crate::types::{Message, Response};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        name: &'static str,
        fail_close: bool,
        closes: AtomicUsize,
    }

    impl FakeProvider {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_close: false,
                closes: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_close: true,
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn models(&self) -> Vec<String> {
            vec!["fake-1".into()]
        }

        async fn chat(
            &self,
            _ctx: &CallContext,
            _messages: &[Message],
            _opts: ChatOptions,
        ) -> Result<Response, ProviderError> {
            Err(ProviderError::api(self.name, ErrorKind::Unknown, "not implemented"))
        }

        async fn stream(
            &self,
            _ctx: &CallContext,
            _messages: &[Message],
            _opts: ChatOptions,
        ) -> Result<EventStream, ProviderError> {
            Err(ProviderError::api(self.name, ErrorKind::Unknown, "not implemented"))
        }

        fn close(&self) -> Result<(), ProviderError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(ProviderError::api(self.name, ErrorKind::Unknown, "close failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn register_get_has_count() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.count(), 0);
        registry.register("openai", FakeProvider::new("openai")).unwrap();
        registry.register("anthropic", FakeProvider::new("anthropic")).unwrap();
        assert!(registry.has("openai"));
        assert!(!registry.has("gemini"));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get("openai").unwrap().name(), "openai");
        assert_eq!(registry.list(), vec!["anthropic", "openai"]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ProviderRegistry::new();
        registry.register("openai", FakeProvider::new("openai")).unwrap();
        assert_eq!(
            registry.register("openai", FakeProvider::new("openai")).unwrap_err(),
            RegistryError::AlreadyRegistered("openai".into())
        );
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn missing_provider_is_not_found() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.get("nope"), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.unregister("nope"), Err(RegistryError::NotFound(_))));
        assert_eq!(registry.register("", FakeProvider::new("x")).unwrap_err(), RegistryError::EmptyName);
    }

    #[test]
    fn unregister_removes() {
        let registry = ProviderRegistry::new();
        registry.register("ollama", FakeProvider::new("ollama")).unwrap();
        registry.unregister("ollama").unwrap();
        assert!(!registry.has("ollama"));
    }

    #[test]
    fn close_closes_all_and_aggregates_failures() {
        let registry = ProviderRegistry::new();
        let good = FakeProvider::new("good");
        let bad = FakeProvider::failing("bad");
        registry.register("good", good.clone()).unwrap();
        registry.register("bad", bad.clone()).unwrap();

        let err = registry.close().unwrap_err();
        match err {
            RegistryError::CloseFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("bad:"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);
        assert_eq!(bad.closes.load(Ordering::SeqCst), 1);

        // Idempotent, and the registry refuses further use.
        registry.close().unwrap();
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.get("good").err().unwrap(), RegistryError::Closed);
        assert_eq!(
            registry.register("new", FakeProvider::new("new")).unwrap_err(),
            RegistryError::Closed
        );
    }

    #[test]
    fn concurrent_readers() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register("openai", FakeProvider::new("openai")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(registry.get("openai").is_ok());
                        assert!(registry.has("openai"));
                    }
                    if i == 0 {
                        registry.register("late", FakeProvider::new("late")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.count(), 2);
    }
}
