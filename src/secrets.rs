//! Secret provider contract.
//!
//! The engine never stores secrets; the `secrets` expression source loads
//! the full set through this trait once per execution and caches it.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secrets(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, SecretError>;
}

/// Fixed in-memory secret set, for tests and single-node deployments where
/// secrets arrive through configuration.
#[derive(Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secrets(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>, SecretError> {
        Ok(self.secrets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticSecretProvider::new(HashMap::from([(
            "api_key".to_string(),
            "s3cr3t".to_string(),
        )]));
        let secrets = provider
            .get_secrets(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(secrets.get("api_key").map(String::as_str), Some("s3cr3t"));
    }
}
