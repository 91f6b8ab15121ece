//! Plugin invocation contract.
//!
//! The engine never inspects plugin internals. Each connector satisfies one
//! capability, [`PluginInvoker::invoke`], and is registered under its plugin
//! type in an explicit [`PluginInvokerRegistry`] populated at startup —
//! there is no runtime discovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),
    #[error("{0}")]
    Invocation(String),
}

/// One external connector (storage, database, cloud service, ...).
///
/// The cancellation token is advisory: an invoker may observe it to abandon
/// work early, but the engine never preempts an in-flight call.
#[async_trait]
pub trait PluginInvoker: Send + Sync {
    async fn invoke(
        &self,
        operation: &str,
        parameters: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, PluginError>;
}

/// Registry of plugin invokers keyed by plugin type
#[derive(Default)]
pub struct PluginInvokerRegistry {
    invokers: HashMap<String, Arc<dyn PluginInvoker>>,
}

impl PluginInvokerRegistry {
    pub fn new() -> Self {
        Self {
            invokers: HashMap::new(),
        }
    }

    pub fn register(&mut self, plugin_type: impl Into<String>, invoker: Arc<dyn PluginInvoker>) {
        self.invokers.insert(plugin_type.into(), invoker);
    }

    pub fn get(&self, plugin_type: &str) -> Option<Arc<dyn PluginInvoker>> {
        self.invokers.get(plugin_type).cloned()
    }

    pub fn plugin_types(&self) -> impl Iterator<Item = &str> {
        self.invokers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoInvoker;

    #[async_trait]
    impl PluginInvoker for EchoInvoker {
        async fn invoke(
            &self,
            operation: &str,
            parameters: &HashMap<String, Value>,
            _cancel: &CancellationToken,
        ) -> Result<Value, PluginError> {
            match operation {
                "echo" => Ok(json!({ "params": parameters })),
                other => Err(PluginError::UnsupportedOperation(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_invoke() {
        let mut registry = PluginInvokerRegistry::new();
        registry.register("echo", Arc::new(EchoInvoker));

        assert!(registry.get("missing").is_none());

        let invoker = registry.get("echo").unwrap();
        let params = HashMap::from([("k".to_string(), json!("v"))]);
        let result = invoker
            .invoke("echo", &params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result["params"]["k"], json!("v"));

        let err = invoker
            .invoke("drop", &params, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedOperation(_)));
    }
}
