//! Source resolvers: the pluggable lookups behind `${source(key)}` tokens.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::secrets::SecretProvider;

use super::ResolveError;

/// A named lookup the evaluator can dispatch a token to.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, key: &str, cancel: &CancellationToken)
        -> Result<Value, ResolveError>;
}

/// Resolves keys against the execution context (declared variables plus
/// accumulated task outputs).
pub struct DictionaryResolver {
    context: ExecutionContext,
}

impl DictionaryResolver {
    pub fn new(context: ExecutionContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl SourceResolver for DictionaryResolver {
    fn name(&self) -> &str {
        "dictionary"
    }

    async fn resolve(
        &self,
        key: &str,
        _cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        self.context.lookup(key).ok_or_else(|| ResolveError::NotFound {
            source_name: "dictionary".to_string(),
            key: key.to_string(),
        })
    }
}

/// Resolves keys against the tenant's secret set.
///
/// The full set is loaded lazily on first access and cached for the rest of
/// the execution. The cache lock is held across the provider call, so
/// concurrent resolvers awaiting the first load share one fetch.
pub struct SecretsResolver {
    provider: Arc<dyn SecretProvider>,
    cache: Mutex<Option<Arc<HashMap<String, String>>>>,
}

impl SecretsResolver {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(None),
        }
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<HashMap<String, String>>, ResolveError> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            return Ok(Arc::clone(cached));
        }
        let secrets = self
            .provider
            .get_secrets(cancel)
            .await
            .map_err(|e| ResolveError::Source {
                source_name: "secrets".to_string(),
                detail: e.to_string(),
            })?;
        let secrets = Arc::new(secrets);
        *guard = Some(Arc::clone(&secrets));
        Ok(secrets)
    }
}

#[async_trait]
impl SourceResolver for SecretsResolver {
    fn name(&self) -> &str {
        "secrets"
    }

    async fn resolve(&self, key: &str, cancel: &CancellationToken)
        -> Result<Value, ResolveError> {
        let secrets = self.load(cancel).await?;
        secrets
            .get(key)
            .map(|v| Value::String(v.clone()))
            .ok_or_else(|| ResolveError::NotFound {
                source_name: "secrets".to_string(),
                key: key.to_string(),
            })
    }
}
