//! Values substituted into one node's bootstrap data.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::secrets::{
    SecretError, SecretStore, K3S_TOKEN, S3_ACCESS_KEY, S3_SECRET_KEY,
    TAILSCALE_OAUTH_CLIENT_ID, TAILSCALE_OAUTH_CLIENT_SECRET,
};
use crate::topology::{NodeRole, NodeSpec, Topology, K3S_API_PORT};

/// Every placeholder name a context provides.
pub const KEYS: [&str; 15] = [
    "STAGE_NAME",
    "PRIVATE_IP_RANGE",
    "K3S_TOKEN",
    "SERVER_API",
    "NODE_IP",
    "ROLE",
    "TAILSCALE_HOSTNAME",
    "REGISTRATION_TAILNET_AUTH_KEY",
    "KUBERNETES_TAILSCALE_OAUTH_CLIENT_ID",
    "KUBERNETES_TAILSCALE_OAUTH_CLIENT_SECRET",
    "KUBERNETES_TAILSCALE_HOSTNAME",
    "S3_HOST",
    "BACKUP_BUCKET",
    "S3_ACCESS_KEY",
    "S3_SECRET_KEY",
];

/// Backup storage the cluster writes etcd snapshots to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// S3 endpoint host.
    #[serde(default)]
    pub s3_host: String,
    /// Bucket name.
    #[serde(default)]
    pub backup_bucket: String,
}

/// Addresses and secrets for one node.
///
/// Secret fields are redacted in `Debug` output.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub stage_name: String,
    /// Node subnet.
    pub private_ip_range: String,
    pub k3s_token: SecretString,
    /// API endpoint of the bootstrap node.
    pub server_api: String,
    pub node_ip: Ipv4Addr,
    pub role: NodeRole,
    pub tailscale_hostname: String,
    /// Single-use tailnet registration key.
    pub registration_auth_key: SecretString,
    pub oauth_client_id: SecretString,
    pub oauth_client_secret: SecretString,
    /// Tailnet hostname of the cluster API proxy.
    pub cluster_hostname: String,
    pub s3_host: String,
    pub backup_bucket: String,
    pub s3_access_key: SecretString,
    pub s3_secret_key: SecretString,
}

impl BootstrapContext {
    /// Gather the context of a slot.
    ///
    /// `bootstrap_ip` is the node's own address when the slot is the
    /// bootstrap slot.
    ///
    /// # Errors
    /// Returns the first [`SecretError`] from the store.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        topology: &Topology,
        spec: &NodeSpec,
        node_ip: Ipv4Addr,
        bootstrap_ip: Ipv4Addr,
        registration_auth_key: SecretString,
        storage: &StorageSettings,
        secrets: &dyn SecretStore,
    ) -> Result<Self, SecretError> {
        Ok(Self {
            stage_name: topology.stage.clone(),
            private_ip_range: topology.network.subnet.clone(),
            k3s_token: secrets.get(K3S_TOKEN).await?,
            server_api: format!("https://{bootstrap_ip}:{K3S_API_PORT}"),
            node_ip,
            role: spec.node_role(),
            tailscale_hostname: spec.tailnet_hostname(&topology.stage),
            registration_auth_key,
            oauth_client_id: secrets.get(TAILSCALE_OAUTH_CLIENT_ID).await?,
            oauth_client_secret: secrets.get(TAILSCALE_OAUTH_CLIENT_SECRET).await?,
            cluster_hostname: topology.cluster_hostname(),
            s3_host: storage.s3_host.clone(),
            backup_bucket: storage.backup_bucket.clone(),
            s3_access_key: secrets.get(S3_ACCESS_KEY).await?,
            s3_secret_key: secrets.get(S3_SECRET_KEY).await?,
        })
    }

    /// Placeholder values, secrets exposed. Only pass to the renderer.
    #[must_use]
    pub fn to_values(&self) -> HashMap<String, String> {
        let pairs: [(&str, String); 15] = [
            ("STAGE_NAME", self.stage_name.clone()),
            ("PRIVATE_IP_RANGE", self.private_ip_range.clone()),
            ("K3S_TOKEN", self.k3s_token.expose_secret().to_string()),
            ("SERVER_API", self.server_api.clone()),
            ("NODE_IP", self.node_ip.to_string()),
            ("ROLE", self.role.as_str().to_string()),
            ("TAILSCALE_HOSTNAME", self.tailscale_hostname.clone()),
            (
                "REGISTRATION_TAILNET_AUTH_KEY",
                self.registration_auth_key.expose_secret().to_string(),
            ),
            (
                "KUBERNETES_TAILSCALE_OAUTH_CLIENT_ID",
                self.oauth_client_id.expose_secret().to_string(),
            ),
            (
                "KUBERNETES_TAILSCALE_OAUTH_CLIENT_SECRET",
                self.oauth_client_secret.expose_secret().to_string(),
            ),
            ("KUBERNETES_TAILSCALE_HOSTNAME", self.cluster_hostname.clone()),
            ("S3_HOST", self.s3_host.clone()),
            ("BACKUP_BUCKET", self.backup_bucket.clone()),
            ("S3_ACCESS_KEY", self.s3_access_key.expose_secret().to_string()),
            ("S3_SECRET_KEY", self.s3_secret_key.expose_secret().to_string()),
        ];
        pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecretStore;
    use crate::topology::Role;

    async fn context(role: Role, index: u32) -> BootstrapContext {
        let topology = Topology::for_stage("dev", false).with_counts(3, 2);
        let spec = topology.node_specs(role).nth(index as usize).unwrap();
        let node_ip = topology.node_ip(role, index).unwrap();
        let bootstrap_ip = topology.node_ip(Role::ControlPlane, 0).unwrap();
        let secrets = StaticSecretStore::new()
            .with(K3S_TOKEN, "k3s-secret")
            .with(TAILSCALE_OAUTH_CLIENT_ID, "client-id")
            .with(TAILSCALE_OAUTH_CLIENT_SECRET, "client-secret")
            .with(S3_ACCESS_KEY, "access")
            .with(S3_SECRET_KEY, "s3-secret");
        let storage = StorageSettings {
            s3_host: "s3.example.com".to_string(),
            backup_bucket: "backups".to_string(),
        };
        BootstrapContext::resolve(
            &topology,
            &spec,
            node_ip,
            bootstrap_ip,
            SecretString::from("tskey-auth-xyz"),
            &storage,
            &secrets,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_values_cover_every_key() {
        let values = context(Role::Worker, 1).await.to_values();
        for key in KEYS {
            assert!(values.contains_key(key), "missing {key}");
        }
        assert_eq!(values.len(), KEYS.len());
    }

    #[tokio::test]
    async fn test_worker_values() {
        let values = context(Role::Worker, 1).await.to_values();
        assert_eq!(values["NODE_IP"], "10.0.1.21");
        assert_eq!(values["SERVER_API"], "https://10.0.1.10:6443");
        assert_eq!(values["ROLE"], "worker");
        assert_eq!(values["TAILSCALE_HOSTNAME"], "dev-hetzner-worker-server-1");
        assert_eq!(values["KUBERNETES_TAILSCALE_HOSTNAME"], "dev-cluster");
        assert_eq!(values["PRIVATE_IP_RANGE"], "10.0.1.0/24");
        assert_eq!(values["REGISTRATION_TAILNET_AUTH_KEY"], "tskey-auth-xyz");
    }

    #[tokio::test]
    async fn test_control_plane_roles() {
        assert_eq!(context(Role::ControlPlane, 0).await.to_values()["ROLE"], "bootstrap");
        assert_eq!(context(Role::ControlPlane, 2).await.to_values()["ROLE"], "server");
    }

    #[tokio::test]
    async fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", context(Role::Worker, 0).await);
        assert!(!debug.contains("k3s-secret"));
        assert!(!debug.contains("tskey-auth-xyz"));
        assert!(!debug.contains("s3-secret"));
        assert!(debug.contains("dev-hetzner-worker-server-0"));
    }
}
