//! Secret lookup for node bootstrap data.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

/// Shared k3s cluster token.
pub const K3S_TOKEN: &str = "K3S_TOKEN";
/// OAuth client ID of the in-cluster Tailscale operator.
pub const TAILSCALE_OAUTH_CLIENT_ID: &str = "KUBERNETES_TAILSCALE_OAUTH_CLIENT_ID";
/// OAuth client secret of the in-cluster Tailscale operator.
pub const TAILSCALE_OAUTH_CLIENT_SECRET: &str = "KUBERNETES_TAILSCALE_OAUTH_CLIENT_SECRET";
/// Access key of the backup bucket.
pub const S3_ACCESS_KEY: &str = "S3_ACCESS_KEY";
/// Secret key of the backup bucket.
pub const S3_SECRET_KEY: &str = "S3_SECRET_KEY";

/// Every secret a node's bootstrap data needs.
pub const REQUIRED_SECRETS: [&str; 5] = [
    K3S_TOKEN,
    TAILSCALE_OAUTH_CLIENT_ID,
    TAILSCALE_OAUTH_CLIENT_SECRET,
    S3_ACCESS_KEY,
    S3_SECRET_KEY,
];

/// Errors that can occur while resolving secrets.
#[derive(Error, Debug)]
pub enum SecretError {
    /// The secret is not set.
    #[error("Secret '{0}' is not set")]
    Missing(String),

    /// The secret is set but not usable.
    #[error("Secret '{key}' is invalid: {reason}")]
    Invalid { key: String, reason: String },
}

/// Source of secret values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Look up a secret by key.
    async fn get(&self, key: &str) -> Result<SecretString, SecretError>;
}

/// Secrets from environment variables, optionally prefixed.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    /// Read `{prefix}{key}` for every key.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, key: &str) -> Result<SecretString, SecretError> {
        let name = self.var_name(key);
        match std::env::var(&name) {
            Ok(value) if !value.is_empty() => Ok(SecretString::from(value)),
            Ok(_) | Err(std::env::VarError::NotPresent) => Err(SecretError::Missing(name)),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::Invalid {
                key: name,
                reason: "not valid UTF-8".to_string(),
            }),
        }
    }
}

/// In-memory secrets.
#[derive(Clone, Default)]
pub struct StaticSecretStore {
    values: HashMap<String, String>,
}

impl StaticSecretStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Store with a placeholder for every required secret.
    #[must_use]
    pub fn placeholders() -> Self {
        REQUIRED_SECRETS
            .into_iter()
            .fold(Self::new(), |store, key| store.with(key, format!("<{key}>")))
    }
}

impl std::fmt::Debug for StaticSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretStore")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, key: &str) -> Result<SecretString, SecretError> {
        self.values
            .get(key)
            .map(|value| SecretString::from(value.clone()))
            .ok_or_else(|| SecretError::Missing(key.to_string()))
    }
}
