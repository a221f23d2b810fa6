//! Tailscale API request and response models.

use serde::{Deserialize, Serialize};

/// List of devices.
#[derive(Debug, Deserialize)]
pub struct DeviceListResponse {
    /// Devices.
    #[serde(default)]
    pub devices: Vec<TailscaleDevice>,
}

/// Device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailscaleDevice {
    /// Legacy device ID, accepted by every endpoint.
    pub id: String,
    /// Preferred node ID.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Machine hostname.
    pub hostname: String,
    /// MagicDNS name.
    #[serde(default)]
    pub name: String,
    /// ACL tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request body for `POST /tailnet/{tailnet}/keys`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyBody<'a> {
    /// Key capabilities.
    pub capabilities: KeyCapabilities<'a>,
    /// Lifetime in seconds.
    pub expiry_seconds: u64,
    /// Description shown in the admin console.
    pub description: &'a str,
}

/// Capabilities wrapper.
#[derive(Debug, Serialize)]
pub struct KeyCapabilities<'a> {
    /// Device capabilities.
    pub devices: DeviceCapabilities<'a>,
}

/// Device capabilities wrapper.
#[derive(Debug, Serialize)]
pub struct DeviceCapabilities<'a> {
    /// Device creation settings.
    pub create: CreateCapability<'a>,
}

/// Device creation settings.
#[derive(Debug, Serialize)]
pub struct CreateCapability<'a> {
    /// Reusable key.
    pub reusable: bool,
    /// Ephemeral devices.
    pub ephemeral: bool,
    /// Skip device approval.
    pub preauthorized: bool,
    /// Tags applied to new devices.
    pub tags: &'a [String],
}

/// Created key.
#[derive(Debug, Deserialize)]
pub struct KeyResponse {
    /// Key ID.
    pub id: String,
    /// Secret key; only returned on creation.
    pub key: String,
}

/// Error body.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// Message.
    pub message: String,
}
