//! Fallback strategy registry
//!
//! Providers serve a degraded version of an operation category when the
//! primary path fails. The first registered provider that can handle a
//! category is used.

use async_trait::async_trait;
use baton_core::{BatonError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Degraded-service provider for one or more operation categories
#[async_trait]
pub trait FallbackProvider: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, category: &str) -> bool;

    async fn execute(
        &self,
        category: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Provider that answers every listed category with a fixed value
pub struct StaticFallback {
    name: String,
    categories: Vec<String>,
    value: serde_json::Value,
}

impl StaticFallback {
    pub fn new(name: impl Into<String>, categories: &[&str], value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            categories: categories.iter().map(|c| c.to_string()).collect(),
            value,
        }
    }
}

#[async_trait]
impl FallbackProvider for StaticFallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category || c == "*")
    }

    async fn execute(
        &self,
        _category: &str,
        _payload: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(self.value.clone())
    }
}

/// Result of a fallback-protected execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackOutcome {
    pub value: serde_json::Value,
    /// "primary", a provider name, or "default"
    pub served_by: String,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl FallbackOutcome {
    fn primary(value: serde_json::Value) -> Self {
        Self {
            value,
            served_by: "primary".to_string(),
            degraded: false,
            warnings: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct FallbackRegistry {
    providers: RwLock<Vec<Arc<dyn FallbackProvider>>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn FallbackProvider>) {
        info!(provider = provider.name(), "Registered fallback provider");
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(provider);
    }

    /// First provider able to serve `category`
    pub fn provider_for(&self, category: &str) -> Option<Arc<dyn FallbackProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.can_handle(category))
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Run `primary`, then the first matching provider
    ///
    /// Fails with `FallbackExhausted` when the primary fails and no provider
    /// can serve the category or the provider fails too.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        category: &str,
        primary: F,
        payload: &serde_json::Value,
    ) -> Result<FallbackOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        let primary_error = match primary().await {
            Ok(value) => return Ok(FallbackOutcome::primary(value)),
            Err(e) => e,
        };

        let Some(provider) = self.provider_for(category) else {
            warn!(%category, error = %primary_error, "Primary failed with no fallback provider");
            return Err(BatonError::FallbackExhausted {
                category: category.to_string(),
                primary: primary_error,
                fallback: anyhow::anyhow!("no fallback provider handles {}", category),
            });
        };

        debug!(%category, provider = provider.name(), "Primary failed, trying fallback");
        match provider.execute(category, payload).await {
            Ok(value) => Ok(FallbackOutcome {
                value,
                served_by: provider.name().to_string(),
                degraded: true,
                warnings: vec![format!("primary failed: {:#}", primary_error)],
            }),
            Err(fallback_error) => {
                warn!(%category, provider = provider.name(), error = %fallback_error, "Fallback failed");
                Err(BatonError::FallbackExhausted {
                    category: category.to_string(),
                    primary: primary_error,
                    fallback: fallback_error.context(format!("provider {}", provider.name())),
                })
            }
        }
    }

    /// Like [`execute_with_fallback`](Self::execute_with_fallback) but never
    /// fails: when everything fails `default` is returned, marked degraded
    pub async fn graceful_degradation<F, Fut>(
        &self,
        category: &str,
        primary: F,
        payload: &serde_json::Value,
        default: serde_json::Value,
    ) -> FallbackOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        match self.execute_with_fallback(category, primary, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%category, error = %e, "Serving default value");
                FallbackOutcome {
                    value: default,
                    served_by: "default".to_string(),
                    degraded: true,
                    warnings: vec![e.to_string()],
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky;

    #[async_trait]
    impl FallbackProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn can_handle(&self, category: &str) -> bool {
            category == "search"
        }

        async fn execute(&self, _: &str, _: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("index offline")
        }
    }

    #[tokio::test]
    async fn test_primary_success_is_not_degraded() {
        let registry = FallbackRegistry::new();
        let outcome = registry
            .execute_with_fallback("search", || async { Ok(json!([1, 2])) }, &json!({}))
            .await
            .unwrap();

        assert_eq!(outcome.served_by, "primary");
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_first_matching_provider_serves() {
        let registry = FallbackRegistry::new();
        registry.register(Arc::new(StaticFallback::new("docs-cache", &["docs"], json!("cached docs"))));
        registry.register(Arc::new(StaticFallback::new("search-cache", &["search"], json!([]))));
        registry.register(Arc::new(StaticFallback::new("catch-all", &["*"], json!(null))));

        let primary_calls = AtomicU32::new(0);
        let outcome = registry
            .execute_with_fallback(
                "search",
                || async {
                    primary_calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("timeout"))
                },
                &json!({"q": "rust"}),
            )
            .await
            .unwrap();

        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.served_by, "search-cache");
        assert!(outcome.degraded);
        assert_eq!(outcome.value, json!([]));
    }

    #[tokio::test]
    async fn test_exhausted_names_both_failures() {
        let registry = FallbackRegistry::new();
        registry.register(Arc::new(Flaky));

        let err = registry
            .execute_with_fallback("search", || async { Err(anyhow::anyhow!("timeout")) }, &json!({}))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("timeout"));
        assert!(message.contains("index offline"));

        let err = registry
            .execute_with_fallback("render", || async { Err(anyhow::anyhow!("boom")) }, &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no fallback provider"));
    }

    #[tokio::test]
    async fn test_graceful_degradation_always_usable() {
        let registry = FallbackRegistry::new();
        let outcome = registry
            .graceful_degradation(
                "render",
                || async { Err(anyhow::anyhow!("gpu lost")) },
                &json!({}),
                json!({"text": "plain"}),
            )
            .await;

        assert!(outcome.degraded);
        assert_eq!(outcome.served_by, "default");
        assert_eq!(outcome.value, json!({"text": "plain"}));
        assert!(!outcome.warnings.is_empty());
    }
}
