//! Hetzner Cloud API request and response models.
//!
//! Based on the Hetzner Cloud API documentation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::providers::traits::{FirewallRule, HealthCheck};

// ============================================================================
// Common types
// ============================================================================

/// Error envelope.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ApiError,
}

/// Error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    /// Machine readable code (e.g. `uniqueness_error`).
    pub code: String,
    /// Human readable message.
    pub message: String,
}

/// Asynchronous action.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    /// Action ID.
    pub id: u64,
    /// Command (e.g. `create_server`).
    pub command: String,
    /// `running`, `success` or `error`.
    pub status: String,
    /// Progress in percent.
    #[serde(default)]
    pub progress: u8,
    /// Error if the action failed.
    #[serde(default)]
    pub error: Option<ApiError>,
}

/// Single action response.
#[derive(Debug, Deserialize)]
pub struct ActionResponse {
    /// The action.
    pub action: Action,
}

/// Pagination metadata.
#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    /// Pagination.
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// Pagination details.
#[derive(Debug, Deserialize)]
pub struct Pagination {
    /// Current page.
    pub page: u32,
    /// Next page, if any.
    pub next_page: Option<u32>,
}

// ============================================================================
// Network types
// ============================================================================

/// Network.
#[derive(Debug, Deserialize)]
pub struct HcloudNetwork {
    /// Network ID.
    pub id: u64,
    /// Network name.
    pub name: String,
    /// Network range.
    pub ip_range: String,
    /// Subnets.
    #[serde(default)]
    pub subnets: Vec<HcloudSubnet>,
}

/// Subnet of a network.
#[derive(Debug, Serialize, Deserialize)]
pub struct HcloudSubnet {
    /// Subnet type (`cloud`).
    #[serde(rename = "type")]
    pub subnet_type: String,
    /// Subnet range.
    pub ip_range: String,
    /// Network zone.
    pub network_zone: String,
}

/// List of networks.
#[derive(Debug, Deserialize)]
pub struct NetworkListResponse {
    /// Networks.
    #[serde(default)]
    pub networks: Vec<HcloudNetwork>,
}

/// Single network.
#[derive(Debug, Deserialize)]
pub struct NetworkResponse {
    /// Network.
    pub network: HcloudNetwork,
}

/// Request body for `POST /networks`.
#[derive(Debug, Serialize)]
pub struct CreateNetworkBody<'a> {
    /// Network name.
    pub name: &'a str,
    /// Network range.
    pub ip_range: &'a str,
    /// Labels.
    pub labels: &'a BTreeMap<String, String>,
}

// ============================================================================
// Firewall / placement group types
// ============================================================================

/// Firewall.
#[derive(Debug, Deserialize)]
pub struct HcloudFirewall {
    /// Firewall ID.
    pub id: u64,
    /// Firewall name.
    pub name: String,
}

/// List of firewalls.
#[derive(Debug, Deserialize)]
pub struct FirewallListResponse {
    /// Firewalls.
    #[serde(default)]
    pub firewalls: Vec<HcloudFirewall>,
}

/// Create firewall response.
#[derive(Debug, Deserialize)]
pub struct FirewallResponse {
    /// Firewall.
    pub firewall: HcloudFirewall,
    /// Actions applying the firewall.
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Request body for `POST /firewalls`.
#[derive(Debug, Serialize)]
pub struct CreateFirewallBody<'a> {
    /// Firewall name.
    pub name: &'a str,
    /// Rules.
    pub rules: &'a [FirewallRule],
    /// Labels.
    pub labels: &'a BTreeMap<String, String>,
}

/// Placement group.
#[derive(Debug, Deserialize)]
pub struct HcloudPlacementGroup {
    /// Placement group ID.
    pub id: u64,
    /// Placement group name.
    pub name: String,
}

/// List of placement groups.
#[derive(Debug, Deserialize)]
pub struct PlacementGroupListResponse {
    /// Placement groups.
    #[serde(default)]
    pub placement_groups: Vec<HcloudPlacementGroup>,
}

/// Single placement group.
#[derive(Debug, Deserialize)]
pub struct PlacementGroupResponse {
    /// Placement group.
    pub placement_group: HcloudPlacementGroup,
}

/// Request body for `POST /placement_groups`.
#[derive(Debug, Serialize)]
pub struct CreatePlacementGroupBody<'a> {
    /// Name.
    pub name: &'a str,
    /// Always `spread`.
    #[serde(rename = "type")]
    pub group_type: &'a str,
    /// Labels.
    pub labels: &'a BTreeMap<String, String>,
}

// ============================================================================
// Load balancer types
// ============================================================================

/// Load balancer.
#[derive(Debug, Deserialize)]
pub struct HcloudLoadBalancer {
    /// Load balancer ID.
    pub id: u64,
    /// Name.
    pub name: String,
    /// Public addresses.
    #[serde(default)]
    pub public_net: Option<LoadBalancerPublicNet>,
    /// Private network attachments.
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
}

/// Public addresses of a load balancer.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerPublicNet {
    /// IPv4.
    #[serde(default)]
    pub ipv4: Option<IpAddress>,
}

/// Address wrapper.
#[derive(Debug, Deserialize)]
pub struct IpAddress {
    /// Address.
    #[serde(default)]
    pub ip: Option<String>,
}

/// Private network attachment.
#[derive(Debug, Deserialize)]
pub struct PrivateNet {
    /// Network ID.
    pub network: u64,
    /// Address on the network.
    #[serde(default)]
    pub ip: Option<String>,
}

/// List of load balancers.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerListResponse {
    /// Load balancers.
    #[serde(default)]
    pub load_balancers: Vec<HcloudLoadBalancer>,
}

/// Single load balancer.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerResponse {
    /// Load balancer.
    pub load_balancer: HcloudLoadBalancer,
    /// Creation action.
    #[serde(default)]
    pub action: Option<Action>,
}

/// Algorithm wrapper.
#[derive(Debug, Serialize)]
pub struct Algorithm<'a> {
    /// Algorithm name.
    #[serde(rename = "type")]
    pub algorithm_type: &'a str,
}

/// Request body for `POST /load_balancers`.
#[derive(Debug, Serialize)]
pub struct CreateLoadBalancerBody<'a> {
    /// Name.
    pub name: &'a str,
    /// Load balancer type.
    pub load_balancer_type: &'a str,
    /// Location.
    pub location: &'a str,
    /// Algorithm.
    pub algorithm: Algorithm<'a>,
    /// Labels.
    pub labels: &'a BTreeMap<String, String>,
}

/// Request body for `attach_to_network` actions.
#[derive(Debug, Serialize)]
pub struct AttachToNetworkBody {
    /// Network ID.
    pub network: u64,
    /// Fixed address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Request body for `add_service`.
#[derive(Debug, Serialize)]
pub struct AddServiceBody<'a> {
    /// Protocol.
    pub protocol: &'a str,
    /// Public port.
    pub listen_port: u16,
    /// Target port.
    pub destination_port: u16,
    /// PROXY protocol.
    pub proxyprotocol: bool,
    /// Health check.
    pub health_check: &'a HealthCheck,
}

/// Target server reference.
#[derive(Debug, Serialize)]
pub struct TargetServer {
    /// Server ID.
    pub id: u64,
}

/// Request body for `add_target`.
#[derive(Debug, Serialize)]
pub struct AddTargetBody {
    /// Always `server`.
    #[serde(rename = "type")]
    pub target_type: &'static str,
    /// Server.
    pub server: TargetServer,
    /// Route through the private network.
    pub use_private_ip: bool,
}

// ============================================================================
// Server types
// ============================================================================

/// Server.
#[derive(Debug, Deserialize)]
pub struct HcloudServer {
    /// Server ID.
    pub id: u64,
    /// Name.
    pub name: String,
    /// Status (`initializing`, `running`, `off`, ...).
    pub status: String,
    /// Creation timestamp (RFC 3339).
    #[serde(default)]
    pub created: Option<String>,
    /// Public addresses.
    #[serde(default)]
    pub public_net: Option<ServerPublicNet>,
    /// Private network attachments.
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    /// Protection flags.
    #[serde(default)]
    pub protection: ServerProtection,
    /// Labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Protection flags of a server.
#[derive(Debug, Default, Deserialize)]
pub struct ServerProtection {
    /// Delete protection.
    #[serde(default)]
    pub delete: bool,
    /// Rebuild protection.
    #[serde(default)]
    pub rebuild: bool,
}

/// Public addresses of a server.
#[derive(Debug, Deserialize)]
pub struct ServerPublicNet {
    /// IPv4.
    #[serde(default)]
    pub ipv4: Option<IpAddress>,
    /// IPv6 network.
    #[serde(default)]
    pub ipv6: Option<IpAddress>,
}

/// Create server response.
#[derive(Debug, Deserialize)]
pub struct CreateServerResponse {
    /// Server.
    pub server: HcloudServer,
    /// Creation action.
    pub action: Action,
    /// Follow-up actions.
    #[serde(default)]
    pub next_actions: Vec<Action>,
}

/// Single server.
#[derive(Debug, Deserialize)]
pub struct ServerResponse {
    /// Server.
    pub server: HcloudServer,
}

/// List of servers.
#[derive(Debug, Deserialize)]
pub struct ServerListResponse {
    /// Servers.
    #[serde(default)]
    pub servers: Vec<HcloudServer>,
    /// Pagination.
    #[serde(default)]
    pub meta: Meta,
}

/// Firewall reference in a create server request.
#[derive(Debug, Serialize)]
pub struct FirewallRef {
    /// Firewall ID.
    pub firewall: u64,
}

/// Public interface settings.
#[derive(Debug, Serialize)]
pub struct PublicNetBody {
    /// Assign a public IPv4.
    pub enable_ipv4: bool,
    /// Assign a public IPv6.
    pub enable_ipv6: bool,
}

/// Request body for `POST /servers`.
#[derive(Debug, Serialize)]
pub struct CreateServerBody<'a> {
    /// Name.
    pub name: &'a str,
    /// Server type.
    pub server_type: &'a str,
    /// Image.
    pub image: &'a str,
    /// Location.
    pub location: &'a str,
    /// Placement group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<u64>,
    /// Firewalls.
    pub firewalls: Vec<FirewallRef>,
    /// Labels.
    pub labels: &'a BTreeMap<String, String>,
    /// Cloud-init data.
    pub user_data: &'a str,
    /// Public interface.
    pub public_net: PublicNetBody,
    /// Boot right away.
    pub start_after_create: bool,
}

/// Request body for `change_protection`.
#[derive(Debug, Serialize)]
pub struct ChangeProtectionBody {
    /// Delete protection.
    pub delete: bool,
    /// Rebuild protection.
    pub rebuild: bool,
}
