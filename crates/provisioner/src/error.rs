//! Error types for cluster provisioning.
//!
//! Errors are grouped by how far they propagate:
//!
//! - [`ConfigError`] rejects a topology before any provider call is made.
//! - [`ProvisionError::Provisioning`] halts the role whose node failed; on the
//!   bootstrap node it ends the whole run.
//! - [`RegistryError`](crate::registry::RegistryError) failures during
//!   reconciliation are collected per device and never abort the run.

use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::TemplateError;
use crate::providers::ProviderError;
use crate::registry::RegistryError;
use crate::secrets::SecretError;
use crate::topology::Role;

/// Invalid topology or configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// More control-plane nodes than the cluster supports.
    #[error(
        "You can only have {max} control plane nodes. Please reduce the number of control plane nodes. Currently: {count}"
    )]
    TooManyControlPlaneNodes { count: u32, max: u32 },

    /// Workers were requested without a bootstrap node to join.
    #[error("{workers} worker node(s) requested but the control plane is empty")]
    WorkersWithoutControlPlane { workers: u32 },

    /// A CIDR string could not be parsed.
    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// The node subnet does not sit inside the private network.
    #[error("Subnet {subnet} is not inside network {network}")]
    SubnetOutsideNetwork { subnet: String, network: String },

    /// `offset + index` does not fit in the fourth octet.
    #[error("Fourth octet {octet} exceeds 255")]
    OctetOverflow { octet: u32 },

    /// A role's address range leaves the fourth octet.
    #[error("Address for {role} node {index} overflows the fourth octet ({octet} > 255)")]
    AddressOverflow { role: Role, index: u32, octet: u32 },

    /// Two roles share part of their address range.
    #[error(
        "Address ranges overlap: {first} uses .{first_start}-.{first_end}, {second} uses .{second_start}-.{second_end}"
    )]
    OverlappingRanges {
        first: Role,
        first_start: u32,
        first_end: u32,
        second: Role,
        second_start: u32,
        second_end: u32,
    },

    /// No start offset configured for a role.
    #[error("No address offset configured for {0}")]
    MissingOffset(Role),

    /// Stage name is empty or not usable in hostnames.
    #[error("Invalid stage name '{0}': use lowercase letters, digits and '-'")]
    InvalidStage(String),

    /// Generic invalid value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors surfaced by a provisioning run.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Topology rejected before any resource was touched.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shared infrastructure (network, firewall, load balancer, ...) failed.
    #[error("Failed to ensure {resource}: {source}")]
    Infrastructure {
        resource: String,
        #[source]
        source: ProviderError,
    },

    /// The provider rejected a create/delete call for a node.
    #[error("Provisioning {role} node {index} failed: {source}")]
    Provisioning {
        role: Role,
        index: u32,
        #[source]
        source: ProviderError,
    },

    /// A secret needed for the node's bootstrap data was unavailable.
    #[error("Resolving secrets for {role} node {index} failed: {source}")]
    Secret {
        role: Role,
        index: u32,
        #[source]
        source: SecretError,
    },

    /// The node's device registration key could not be issued.
    #[error("Issuing registration key for {role} node {index} failed: {source}")]
    RegistrationKey {
        role: Role,
        index: u32,
        #[source]
        source: RegistryError,
    },

    /// Strict template rendering found unresolved placeholders.
    #[error("Rendering bootstrap data for {role} node {index} failed: {source}")]
    Template {
        role: Role,
        index: u32,
        #[source]
        source: TemplateError,
    },

    /// Device registry failure outside of per-device reconciliation.
    #[error("Device registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A sequencer was asked to start a slot whose guard does not hold.
    #[error("{role} node {index} cannot start before its predecessor and the bootstrap node are ready")]
    OutOfOrder { role: Role, index: u32 },
}

impl ProvisionError {
    /// Role and index of the node this error belongs to, if any.
    #[must_use]
    pub fn node(&self) -> Option<(Role, u32)> {
        match self {
            Self::Provisioning { role, index, .. }
            | Self::Secret { role, index, .. }
            | Self::RegistrationKey { role, index, .. }
            | Self::Template { role, index, .. }
            | Self::OutOfOrder { role, index } => Some((*role, *index)),
            _ => None,
        }
    }
}
