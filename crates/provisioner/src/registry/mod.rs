//! Device registry (tailnet) abstractions.
//!
//! Every node joins the tailnet with a single-use registration key and
//! registers under a deterministic hostname. The reconciler uses the same
//! registry to remove devices whose node no longer exists.

pub mod tailscale;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

pub use tailscale::Tailscale;

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A device known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDevice {
    /// Device identifier.
    pub id: String,
    /// Short hostname the device registered with.
    pub hostname: String,
    /// Fully qualified name (e.g. `host.tailnet.ts.net`).
    pub name: String,
    /// ACL tags.
    pub tags: Vec<String>,
}

/// Device filter: a device matches when it carries every tag and, if set,
/// its hostname starts with the prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    /// Tags a device must carry.
    pub tags: Vec<String>,
    /// Optional hostname prefix.
    pub hostname_prefix: Option<String>,
}

impl TagFilter {
    /// Filter on a set of tags.
    #[must_use]
    pub fn new(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            hostname_prefix: None,
        }
    }

    /// Additionally require a hostname prefix.
    #[must_use]
    pub fn with_hostname_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hostname_prefix = Some(prefix.into());
        self
    }

    /// Whether a device matches.
    #[must_use]
    pub fn matches(&self, device: &RegistryDevice) -> bool {
        let tags_ok = self.tags.iter().all(|tag| device.tags.contains(tag));
        let prefix_ok = self
            .hostname_prefix
            .as_deref()
            .is_none_or(|prefix| device.hostname.starts_with(prefix));
        tags_ok && prefix_ok
    }
}

/// Request for a device registration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthKeyRequest {
    /// Key description.
    pub description: String,
    /// Tags applied to devices registering with the key.
    pub tags: Vec<String>,
    /// Whether the key can be used more than once.
    pub reusable: bool,
    /// Devices skip manual approval.
    pub preauthorized: bool,
    /// Key lifetime in seconds.
    pub expiry_seconds: u64,
}

/// Registration key lifetime.
pub const AUTH_KEY_EXPIRY_SECS: u64 = 1800;

impl AuthKeyRequest {
    /// Single-use, preauthorized key for one node.
    #[must_use]
    pub fn single_use(description: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            description: description.into(),
            tags,
            reusable: false,
            preauthorized: true,
            expiry_seconds: AUTH_KEY_EXPIRY_SECS,
        }
    }
}

/// An issued registration key.
#[derive(Debug, Clone)]
pub struct AuthKey {
    /// Key identifier.
    pub id: String,
    /// Secret key material.
    pub key: SecretString,
}

/// Trait for the registry nodes join after boot.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// List devices matching a filter.
    async fn list_devices(&self, filter: &TagFilter) -> Result<Vec<RegistryDevice>, RegistryError>;

    /// Delete a device. Deleting a missing device succeeds.
    async fn delete_device(&self, id: &str) -> Result<(), RegistryError>;

    /// Issue a registration key.
    async fn create_auth_key(&self, req: AuthKeyRequest) -> Result<AuthKey, RegistryError>;
}
