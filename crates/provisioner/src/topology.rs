//! Cluster topology: roles, node slots and the desired layout of a stage.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::address;
use crate::error::ConfigError;
use crate::providers::FirewallRule;

/// Maximum number of control-plane nodes.
pub const MAX_CONTROL_PLANE_NODES: u32 = 10;

/// Servers per spread placement group (Hetzner limit).
pub const NODES_PER_PLACEMENT_GROUP: u32 = 10;

/// Kubernetes API port on the bootstrap node.
pub const K3S_API_PORT: u16 = 6443;

/// Node role within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// k3s server nodes; index 0 bootstraps the cluster.
    ControlPlane,
    /// k3s agent nodes.
    Worker,
}

impl Role {
    /// All roles in provisioning order.
    pub const ALL: [Role; 2] = [Role::ControlPlane, Role::Worker];

    /// Slug used in names, labels and tags.
    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }

    /// `PascalCase` name used in resource identifiers.
    #[must_use]
    pub const fn resource_name(self) -> &'static str {
        match self {
            Self::ControlPlane => "ControlPlane",
            Self::Worker => "Worker",
        }
    }

    /// Human readable name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::ControlPlane => "Control Plane",
            Self::Worker => "Worker",
        }
    }

    /// Device registry tag for nodes of this role.
    #[must_use]
    pub fn tag(self) -> String {
        format!("tag:{}", self.slug())
    }

    /// Parse a role from its slug.
    #[must_use]
    pub fn from_slug(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.slug() == s)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Role a node announces in its bootstrap data (`ROLE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// First control-plane node; initialises the cluster.
    Bootstrap,
    /// Additional control-plane node joining the bootstrap node.
    Server,
    /// Agent node.
    Worker,
}

impl NodeRole {
    /// Node role for a topology slot.
    #[must_use]
    pub const fn for_slot(role: Role, index: u32) -> Self {
        match (role, index) {
            (Role::ControlPlane, 0) => Self::Bootstrap,
            (Role::ControlPlane, _) => Self::Server,
            (Role::Worker, _) => Self::Worker,
        }
    }

    /// Value substituted for `ROLE`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Server => "server",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSpec {
    /// Role of the slot.
    pub role: Role,
    /// Zero-based index within the role.
    pub index: u32,
    /// Desired node count for the role this pass.
    pub desired_count: u32,
}

impl NodeSpec {
    /// Whether this slot is the cluster bootstrap node.
    #[must_use]
    pub const fn is_bootstrap(&self) -> bool {
        matches!(self.role, Role::ControlPlane) && self.index == 0
    }

    /// Role announced in bootstrap data.
    #[must_use]
    pub const fn node_role(&self) -> NodeRole {
        NodeRole::for_slot(self.role, self.index)
    }

    /// Cloud instance name.
    #[must_use]
    pub fn instance_name(&self, stage: &str) -> String {
        format!("{stage}-{}-server-{}", self.role.slug(), self.index)
    }

    /// Hostname the node registers with in the tailnet.
    #[must_use]
    pub fn tailnet_hostname(&self, stage: &str) -> String {
        format!("{stage}-hetzner-{}-server-{}", self.role.slug(), self.index)
    }

    /// Index of the placement group this node belongs to.
    #[must_use]
    pub const fn placement_group(&self) -> u32 {
        self.index / NODES_PER_PLACEMENT_GROUP
    }
}

/// A node that exists in the cloud after a provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedNode {
    /// Role of the node.
    pub role: Role,
    /// Index within the role.
    pub index: u32,
    /// Address on the private network.
    pub private_ip: Ipv4Addr,
    /// Cloud instance identifier.
    pub instance_id: u64,
    /// Cloud instance name.
    pub name: String,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Public IPv6 network.
    pub public_ipv6: Option<String>,
    /// Hostname in the tailnet.
    pub tailnet_hostname: String,
    /// Whether this is the bootstrap node.
    pub is_bootstrap: bool,
}

/// Private addressing of the node subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Subnet the node addresses are carved from (e.g. `10.0.1.0/24`).
    pub cidr: String,
    /// First fourth-octet value per role.
    pub role_start_offset: BTreeMap<Role, u8>,
}

impl NetworkConfig {
    /// Start offset of a role.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingOffset`] if the role has none.
    pub fn offset(&self, role: Role) -> Result<u8, ConfigError> {
        self.role_start_offset
            .get(&role)
            .copied()
            .ok_or(ConfigError::MissingOffset(role))
    }
}

/// Count and addressing of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Desired number of nodes.
    #[serde(default)]
    pub count: u32,
    /// Fourth octet of the first node's private address.
    pub start_offset: u8,
}

/// Machine placement of servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server type (e.g. `cx23`). Servers can only be upgraded, not downgraded.
    pub server_type: String,
    /// OS image.
    pub image: String,
    /// Location (e.g. `fsn1`).
    pub location: String,
}

/// Private network layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network range.
    pub ip_range: String,
    /// Node subnet inside the network.
    pub subnet: String,
    /// Network zone of the subnet (e.g. `eu-central`).
    pub zone: String,
}

/// Load balancer algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    RoundRobin,
    LeastConnections,
}

impl LoadBalancerAlgorithm {
    /// API value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
        }
    }
}

/// Public load balancers in front of the cluster ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Number of load balancers; zero disables them.
    #[serde(default)]
    pub count: u32,
    /// Load balancer type (e.g. `lb11`).
    pub load_balancer_type: String,
    /// Balancing algorithm.
    pub algorithm: LoadBalancerAlgorithm,
    /// Public port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Node port traffic is forwarded to.
    #[serde(default = "default_destination_port")]
    pub destination_port: u16,
    /// Forward client addresses with the PROXY protocol.
    #[serde(default = "default_true")]
    pub proxy_protocol: bool,
}

const fn default_listen_port() -> u16 {
    443
}

const fn default_destination_port() -> u16 {
    30443
}

const fn default_true() -> bool {
    true
}

/// Desired cluster layout for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Stage name (`dev`, `prod`, ...); prefixes every resource.
    pub stage: String,
    /// Production stages get delete and rebuild protection.
    #[serde(default)]
    pub production: bool,
    /// Control-plane nodes.
    pub control_plane: RoleConfig,
    /// Worker nodes.
    pub worker: RoleConfig,
    /// Server placement.
    pub server: ServerConfig,
    /// Private network.
    pub network: NetworkSettings,
    /// Public load balancers.
    pub load_balancer: LoadBalancerConfig,
    /// Inbound firewall rules applied to every server.
    #[serde(default = "default_firewall_rules")]
    pub firewall_rules: Vec<FirewallRule>,
    /// Tags every node's registry entry carries, besides the stage tag.
    #[serde(default = "default_registry_tags")]
    pub registry_tags: Vec<String>,
}

fn default_firewall_rules() -> Vec<FirewallRule> {
    vec![FirewallRule::inbound_udp(
        "41641",
        &["0.0.0.0/0", "::/0"],
        "tailscale",
    )]
}

fn default_registry_tags() -> Vec<String> {
    vec!["tag:hetzner".to_string()]
}

impl Topology {
    /// Default layout of a stage.
    #[must_use]
    pub fn for_stage(stage: impl Into<String>, production: bool) -> Self {
        Self {
            stage: stage.into(),
            production,
            control_plane: RoleConfig {
                count: 1,
                start_offset: 10,
            },
            // 20 leaves room for MAX_CONTROL_PLANE_NODES control-plane nodes
            worker: RoleConfig {
                count: 0,
                start_offset: 20,
            },
            server: ServerConfig {
                server_type: if production { "ccx13" } else { "cx23" }.to_string(),
                image: "ubuntu-24.04".to_string(),
                location: if production { "hil" } else { "fsn1" }.to_string(),
            },
            network: NetworkSettings {
                ip_range: "10.0.0.0/8".to_string(),
                subnet: "10.0.1.0/24".to_string(),
                zone: if production { "us-west" } else { "eu-central" }.to_string(),
            },
            load_balancer: LoadBalancerConfig {
                count: u32::from(production),
                load_balancer_type: "lb11".to_string(),
                algorithm: LoadBalancerAlgorithm::LeastConnections,
                listen_port: default_listen_port(),
                destination_port: default_destination_port(),
                proxy_protocol: true,
            },
            firewall_rules: default_firewall_rules(),
            registry_tags: default_registry_tags(),
        }
    }

    /// Set the node counts.
    #[must_use]
    pub fn with_counts(mut self, control_plane: u32, worker: u32) -> Self {
        self.control_plane.count = control_plane;
        self.worker.count = worker;
        self
    }

    /// Role configuration.
    #[must_use]
    pub const fn role(&self, role: Role) -> &RoleConfig {
        match role {
            Role::ControlPlane => &self.control_plane,
            Role::Worker => &self.worker,
        }
    }

    /// Desired node count of a role.
    #[must_use]
    pub const fn count(&self, role: Role) -> u32 {
        self.role(role).count
    }

    /// Addressing used by the allocator.
    #[must_use]
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            cidr: self.network.subnet.clone(),
            role_start_offset: Role::ALL
                .into_iter()
                .map(|role| (role, self.role(role).start_offset))
                .collect(),
        }
    }

    /// Largest node count the address range of a role must hold.
    #[must_use]
    pub fn max_expected(&self, role: Role) -> u32 {
        match role {
            Role::ControlPlane => MAX_CONTROL_PLANE_NODES,
            Role::Worker => self.worker.count,
        }
    }

    /// Slots of a role for this pass.
    pub fn node_specs(&self, role: Role) -> impl Iterator<Item = NodeSpec> {
        let desired_count = self.count(role);
        (0..desired_count).map(move |index| NodeSpec {
            role,
            index,
            desired_count,
        })
    }

    /// Tailnet hostnames of every desired node.
    #[must_use]
    pub fn expected_hostnames(&self) -> std::collections::BTreeSet<String> {
        Role::ALL
            .into_iter()
            .flat_map(|role| self.node_specs(role))
            .map(|spec| spec.tailnet_hostname(&self.stage))
            .collect()
    }

    /// Private address of a slot.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the subnet is invalid or the octet overflows.
    pub fn node_ip(&self, role: Role, index: u32) -> Result<Ipv4Addr, ConfigError> {
        let offset = self.role(role).start_offset;
        address::allocate(&self.network.subnet, offset, index).map_err(|e| match e {
            ConfigError::OctetOverflow { octet } => ConfigError::AddressOverflow {
                role,
                index,
                octet,
            },
            other => other,
        })
    }

    /// Private network name.
    #[must_use]
    pub fn network_name(&self) -> String {
        format!("k3s-private-{}-network", self.stage)
    }

    /// Load balancer name.
    #[must_use]
    pub fn load_balancer_name(&self, index: u32) -> String {
        format!("k3s-public-{}-load-balancer-{index}", self.stage)
    }

    /// Placement group name.
    #[must_use]
    pub fn placement_group_name(&self, role: Role, group: u32) -> String {
        match role {
            Role::ControlPlane => format!("{}-control-plane", self.stage),
            Role::Worker => format!("{}-workers-{group}", self.stage),
        }
    }

    /// Number of placement groups a role needs.
    #[must_use]
    pub fn placement_group_count(&self, role: Role) -> u32 {
        self.count(role).div_ceil(NODES_PER_PLACEMENT_GROUP)
    }

    /// Tailnet hostname of the cluster API proxy.
    #[must_use]
    pub fn cluster_hostname(&self) -> String {
        format!("{}-cluster", self.stage)
    }

    /// Label selector matching every instance this stage manages.
    #[must_use]
    pub fn label_selector(&self) -> String {
        format!("managed-by={MANAGED_BY},stage={}", self.stage)
    }

    /// Labels attached to a node's instance.
    #[must_use]
    pub fn instance_labels(&self, spec: &NodeSpec) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("managed-by".to_string(), MANAGED_BY.to_string()),
            ("stage".to_string(), self.stage.clone()),
            ("role".to_string(), spec.role.slug().to_string()),
            ("index".to_string(), spec.index.to_string()),
            ("tailscale".to_string(), spec.tailnet_hostname(&self.stage)),
        ])
    }

    /// Labels attached to shared resources.
    #[must_use]
    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("managed-by".to_string(), MANAGED_BY.to_string()),
            ("stage".to_string(), self.stage.clone()),
        ])
    }

    /// Registry tags every node of this stage carries.
    #[must_use]
    pub fn stage_tags(&self) -> Vec<String> {
        let mut tags = self.registry_tags.clone();
        tags.push(format!("tag:{}", self.stage));
        tags
    }

    /// Registry tags for a node of the given role.
    #[must_use]
    pub fn node_tags(&self, role: Role) -> Vec<String> {
        let mut tags = self.stage_tags();
        tags.push(role.tag());
        tags
    }

    /// Check the topology before anything is created.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stage_ok = !self.stage.is_empty()
            && self
                .stage
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !self.stage.starts_with('-');
        if !stage_ok {
            return Err(ConfigError::InvalidStage(self.stage.clone()));
        }

        if self.control_plane.count > MAX_CONTROL_PLANE_NODES {
            return Err(ConfigError::TooManyControlPlaneNodes {
                count: self.control_plane.count,
                max: MAX_CONTROL_PLANE_NODES,
            });
        }

        if self.control_plane.count == 0 && self.worker.count > 0 {
            return Err(ConfigError::WorkersWithoutControlPlane {
                workers: self.worker.count,
            });
        }

        let network = address::parse_cidr(&self.network.ip_range)?;
        let subnet = address::parse_cidr(&self.network.subnet)?;
        if !network.contains(&subnet) {
            return Err(ConfigError::SubnetOutsideNetwork {
                subnet: self.network.subnet.clone(),
                network: self.network.ip_range.clone(),
            });
        }

        let max_counts: Vec<(Role, u32)> = Role::ALL
            .into_iter()
            .map(|role| (role, self.max_expected(role)))
            .collect();
        address::validate_ranges(&self.network_config(), &max_counts)?;

        if self.load_balancer.count > 0 && self.load_balancer.load_balancer_type.is_empty() {
            return Err(ConfigError::Invalid(
                "load_balancer.load_balancer_type must be set".to_string(),
            ));
        }

        for (field, value) in [
            ("server.server_type", &self.server.server_type),
            ("server.image", &self.server.image),
            ("server.location", &self.server.location),
            ("network.zone", &self.network.zone),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must be set")));
            }
        }

        Ok(())
    }
}

/// Value of the `managed-by` label.
pub const MANAGED_BY: &str = "provisioner";
