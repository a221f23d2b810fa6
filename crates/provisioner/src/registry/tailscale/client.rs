//! Tailscale API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::models::{
    CreateCapability, CreateKeyBody, DeviceCapabilities, DeviceListResponse, ErrorResponse,
    KeyCapabilities, KeyResponse, TailscaleDevice,
};
use crate::registry::{
    AuthKey, AuthKeyRequest, DeviceRegistry, RegistryDevice, RegistryError, TagFilter,
};

/// Base URL for the Tailscale API.
const API_BASE_URL: &str = "https://api.tailscale.com/api/v2";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Tailscale device registry.
#[derive(Clone)]
pub struct Tailscale {
    /// HTTP client.
    client: Client,
    /// API access token.
    api_key: SecretString,
    /// Tailnet name (`-` selects the key's default tailnet).
    tailnet: String,
    /// API base URL.
    base_url: String,
}

impl Tailscale {
    /// Create a new Tailscale registry client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(api_key: SecretString, tailnet: impl Into<String>) -> Result<Self, RegistryError> {
        Self::with_base_url(api_key, tailnet, API_BASE_URL)
    }

    /// Create a client talking to a different endpoint.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        api_key: SecretString,
        tailnet: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_key,
            tailnet: tailnet.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(self.api_key.expose_secret())
    }

    /// Turn a non-success response into an error.
    async fn error_from(response: reqwest::Response) -> RegistryError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        RegistryError::Api { status, message }
    }

    fn to_device(device: TailscaleDevice) -> RegistryDevice {
        RegistryDevice {
            id: device.node_id.unwrap_or(device.id),
            hostname: device.hostname,
            name: device.name,
            tags: device.tags,
        }
    }
}

#[async_trait]
impl DeviceRegistry for Tailscale {
    async fn list_devices(&self, filter: &TagFilter) -> Result<Vec<RegistryDevice>, RegistryError> {
        let url = format!("{}/tailnet/{}/devices", self.base_url, self.tailnet);
        debug!(url = %url, "GET request");

        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let text = response.text().await?;
        let list: DeviceListResponse = serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, "Failed to parse device list");
            RegistryError::Serialization(e)
        })?;

        let devices: Vec<RegistryDevice> = list
            .devices
            .into_iter()
            .map(Self::to_device)
            .filter(|device| filter.matches(device))
            .collect();

        debug!(count = devices.len(), tags = ?filter.tags, "Listed devices");
        Ok(devices)
    }

    async fn delete_device(&self, id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/device/{id}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self.authed(self.client.delete(&url)).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }

    async fn create_auth_key(&self, req: AuthKeyRequest) -> Result<AuthKey, RegistryError> {
        let url = format!("{}/tailnet/{}/keys", self.base_url, self.tailnet);
        info!(description = %req.description, tags = ?req.tags, "Creating registration key");

        let body = CreateKeyBody {
            capabilities: KeyCapabilities {
                devices: DeviceCapabilities {
                    create: CreateCapability {
                        reusable: req.reusable,
                        ephemeral: false,
                        preauthorized: req.preauthorized,
                        tags: &req.tags,
                    },
                },
            },
            expiry_seconds: req.expiry_seconds,
            description: &req.description,
        };

        let response = self.authed(self.client.post(&url)).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let key: KeyResponse = response.json().await?;
        Ok(AuthKey {
            id: key.id,
            key: SecretString::from(key.key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_body_serialization() {
        let tags = vec!["tag:hetzner".to_string(), "tag:dev".to_string()];
        let body = CreateKeyBody {
            capabilities: KeyCapabilities {
                devices: DeviceCapabilities {
                    create: CreateCapability {
                        reusable: false,
                        ephemeral: false,
                        preauthorized: true,
                        tags: &tags,
                    },
                },
            },
            expiry_seconds: 1800,
            description: "hcloud worker 0 node reg",
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["expirySeconds"], 1800);
        assert_eq!(json["capabilities"]["devices"]["create"]["preauthorized"], true);
        assert_eq!(json["capabilities"]["devices"]["create"]["tags"][1], "tag:dev");
    }

    #[test]
    fn test_device_prefers_node_id() {
        let device: TailscaleDevice = serde_json::from_str(
            r#"{"id": "123", "nodeId": "nABC", "hostname": "dev-cluster", "name": "dev-cluster.tail.ts.net", "tags": ["tag:dev"]}"#,
        )
        .unwrap();
        let converted = Tailscale::to_device(device);
        assert_eq!(converted.id, "nABC");
        assert_eq!(converted.tags, vec!["tag:dev"]);
    }
}
