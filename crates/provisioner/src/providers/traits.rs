//! Cloud provider trait and common types.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// An asynchronous provider action finished with an error.
    #[error("Action '{command}' failed: {message}")]
    Action { command: String, message: String },

    /// Provider-side wait for an action exceeded its limit.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The instance has delete protection enabled.
    #[error("Server {0} has delete protection enabled")]
    Protected(String),

    /// The instance is in a state setup cannot continue from.
    #[error("Server {name} is {status}")]
    UnexpectedState {
        name: String,
        status: InstanceStatus,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Network types
// ============================================================================

/// Private network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network identifier.
    pub id: u64,
    /// Network name.
    pub name: String,
    /// Network range.
    pub ip_range: String,
    /// Subnet ranges already present.
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Request to create a private network.
#[derive(Debug, Clone)]
pub struct CreateNetworkRequest {
    /// Network name.
    pub name: String,
    /// Network range (e.g. `10.0.0.0/8`).
    pub ip_range: String,
    /// Resource labels.
    pub labels: BTreeMap<String, String>,
}

/// Request to add a subnet to a network.
#[derive(Debug, Clone)]
pub struct CreateSubnetRequest {
    /// Parent network.
    pub network_id: u64,
    /// Subnet range (e.g. `10.0.1.0/24`).
    pub ip_range: String,
    /// Network zone (e.g. `eu-central`).
    pub network_zone: String,
}

/// Subnet of a private network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    /// Parent network.
    pub network_id: u64,
    /// Subnet range.
    pub ip_range: String,
    /// Network zone.
    pub network_zone: String,
}

/// Firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    /// `in` or `out`.
    pub direction: String,
    /// `tcp`, `udp`, `icmp`, ...
    pub protocol: String,
    /// Port or port range; none for ICMP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Allowed source ranges.
    #[serde(default)]
    pub source_ips: Vec<String>,
    /// Rule description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FirewallRule {
    /// Inbound UDP rule.
    #[must_use]
    pub fn inbound_udp(port: &str, sources: &[&str], description: &str) -> Self {
        Self {
            direction: "in".to_string(),
            protocol: "udp".to_string(),
            port: Some(port.to_string()),
            source_ips: sources.iter().map(ToString::to_string).collect(),
            description: Some(description.to_string()),
        }
    }
}

/// Request to create a firewall.
#[derive(Debug, Clone)]
pub struct CreateFirewallRequest {
    /// Firewall name.
    pub name: String,
    /// Rules.
    pub rules: Vec<FirewallRule>,
    /// Resource labels.
    pub labels: BTreeMap<String, String>,
}

/// Firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firewall {
    /// Firewall identifier.
    pub id: u64,
    /// Firewall name.
    pub name: String,
}

/// Spread placement group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGroup {
    /// Placement group identifier.
    pub id: u64,
    /// Placement group name.
    pub name: String,
}

// ============================================================================
// Load balancer types
// ============================================================================

/// Request to create a load balancer.
#[derive(Debug, Clone)]
pub struct CreateLoadBalancerRequest {
    /// Load balancer name.
    pub name: String,
    /// Load balancer type (e.g. `lb11`).
    pub load_balancer_type: String,
    /// Location.
    pub location: String,
    /// Algorithm (`round_robin`, `least_connections`).
    pub algorithm: String,
    /// Resource labels.
    pub labels: BTreeMap<String, String>,
}

/// Load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Load balancer identifier.
    pub id: u64,
    /// Load balancer name.
    pub name: String,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Private networks the load balancer is attached to.
    pub networks: Vec<u64>,
}

/// Health check of a load balancer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Protocol.
    pub protocol: String,
    /// Port probed on the target.
    pub port: u16,
    /// Interval in seconds.
    pub interval: u32,
    /// Timeout in seconds.
    pub timeout: u32,
    /// Failed probes before a target is unhealthy.
    pub retries: u32,
}

/// Load balancer service (listener).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancerService {
    /// Protocol.
    pub protocol: String,
    /// Public port.
    pub listen_port: u16,
    /// Target port.
    pub destination_port: u16,
    /// Send the PROXY protocol header to targets.
    pub proxyprotocol: bool,
    /// Health check.
    pub health_check: HealthCheck,
}

// ============================================================================
// Instance types
// ============================================================================

/// Instance status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance is being created.
    Initializing,
    /// Instance is starting.
    Starting,
    /// Instance is running.
    Running,
    /// Instance is stopping.
    Stopping,
    /// Instance is off.
    Off,
    /// Instance is being deleted.
    Deleting,
    /// Instance is being rebuilt.
    Rebuilding,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Off => write!(f, "off"),
            Self::Deleting => write!(f, "deleting"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Address of an instance on a private network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateAddress {
    /// Network identifier.
    pub network_id: u64,
    /// Address on the network.
    pub ip: Ipv4Addr,
}

/// Protection flags of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Protection {
    /// Deletion is refused.
    pub delete: bool,
    /// Rebuild is refused.
    pub rebuild: bool,
}

/// A compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Instance identifier.
    pub id: u64,
    /// Instance name.
    pub name: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Public IPv6 network.
    pub public_ipv6: Option<String>,
    /// Private network attachments.
    pub private_net: Vec<PrivateAddress>,
    /// Protection flags.
    pub protection: Protection,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// When the instance was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Address of the instance on a network, if attached.
    #[must_use]
    pub fn private_ip_on(&self, network_id: u64) -> Option<Ipv4Addr> {
        self.private_net
            .iter()
            .find(|net| net.network_id == network_id)
            .map(|net| net.ip)
    }
}

/// State a node instance must reach before it counts as ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSetup {
    /// Private network to attach.
    pub network_id: u64,
    /// Fixed address on the private network.
    pub private_ip: Ipv4Addr,
    /// Enable delete protection.
    pub delete_protection: bool,
    /// Enable rebuild protection.
    pub rebuild_protection: bool,
}

impl InstanceSetup {
    /// Whether `instance` is attached at the fixed address, carries the
    /// requested protection and is powered on.
    ///
    /// Protection an instance already has is never considered a mismatch.
    #[must_use]
    pub fn is_satisfied_by(&self, instance: &Instance) -> bool {
        instance.private_ip_on(self.network_id) == Some(self.private_ip)
            && (instance.protection.delete || !self.delete_protection)
            && (instance.protection.rebuild || !self.rebuild_protection)
            && matches!(
                instance.status,
                InstanceStatus::Running | InstanceStatus::Starting
            )
    }
}

/// Request to create a compute instance.
///
/// `user_data` carries secrets and is redacted from `Debug` output.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Instance name.
    pub name: String,
    /// Server type.
    pub server_type: String,
    /// OS image.
    pub image: String,
    /// Location.
    pub location: String,
    /// Spread placement group.
    pub placement_group_id: Option<u64>,
    /// Firewalls applied to the public interface.
    pub firewall_ids: Vec<u64>,
    /// Private network to attach.
    pub network_id: u64,
    /// Fixed address on the private network.
    pub private_ip: Ipv4Addr,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Rendered cloud-init data.
    pub user_data: SecretString,
    /// Enable delete protection.
    pub delete_protection: bool,
    /// Enable rebuild protection.
    pub rebuild_protection: bool,
}

impl CreateInstanceRequest {
    /// Setup the created instance must end up with.
    #[must_use]
    pub fn setup(&self) -> InstanceSetup {
        InstanceSetup {
            network_id: self.network_id,
            private_ip: self.private_ip,
            delete_protection: self.delete_protection,
            rebuild_protection: self.rebuild_protection,
        }
    }
}

/// Trait for the cloud provider that hosts the cluster.
///
/// Create operations are get-or-create by name: when a resource with the
/// requested name already exists it is returned unchanged.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a private network.
    async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network, ProviderError>;

    /// Add a subnet to a network.
    async fn create_subnet(&self, req: CreateSubnetRequest) -> Result<Subnet, ProviderError>;

    /// Create a firewall.
    async fn create_firewall(&self, req: CreateFirewallRequest)
        -> Result<Firewall, ProviderError>;

    /// Create a spread placement group.
    async fn create_placement_group(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<PlacementGroup, ProviderError>;

    /// Create a load balancer.
    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer, ProviderError>;

    /// Attach a load balancer to a private network.
    async fn attach_load_balancer_network(
        &self,
        load_balancer_id: u64,
        network_id: u64,
    ) -> Result<(), ProviderError>;

    /// Add a service to a load balancer.
    async fn add_load_balancer_service(
        &self,
        load_balancer_id: u64,
        service: &LoadBalancerService,
    ) -> Result<(), ProviderError>;

    /// Register an instance as a load balancer target.
    ///
    /// Registering an already registered target succeeds.
    async fn attach_load_balancer_target(
        &self,
        load_balancer_id: u64,
        instance_id: u64,
        use_private_ip: bool,
    ) -> Result<(), ProviderError>;

    /// Create an instance and wait until the provider reports it created.
    ///
    /// An instance with the same name that is not yet fully set up is
    /// completed as by [`CloudProvider::complete_instance`].
    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, ProviderError>;

    /// Finish the setup of an existing instance: attach it to the private
    /// network, apply protection and power it on, skipping what already holds.
    ///
    /// Fails if the instance sits at a different address on the network or
    /// is in a state it cannot be powered on from.
    async fn complete_instance(
        &self,
        instance: Instance,
        setup: &InstanceSetup,
    ) -> Result<Instance, ProviderError>;

    /// Shut down and delete an instance. Deleting a missing instance succeeds.
    ///
    /// An instance with delete protection is left untouched and
    /// [`ProviderError::Protected`] is returned.
    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError>;

    /// List instances matching a label selector.
    async fn list_instances(&self, label_selector: &str) -> Result<Vec<Instance>, ProviderError>;
}
