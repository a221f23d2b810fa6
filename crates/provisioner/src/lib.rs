//! k3s cluster provisioning on Hetzner Cloud.
//!
//! This crate turns a declarative [`Topology`] into running nodes: it
//! ensures the private network, firewall, placement groups and load
//! balancers, creates the bootstrap node before any other node, rolls out
//! the remaining control-plane and worker nodes in index order, and removes
//! tailnet devices that no longer belong to a node.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use provisioner::{EnvSecretStore, HetznerCloud, Orchestrator, Tailscale, Topology};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topology = Topology::for_stage("dev", false).with_counts(3, 2);
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(HetznerCloud::new(hcloud_token)?),
//!         Arc::new(Tailscale::new(tailscale_key, "-")?),
//!         Arc::new(EnvSecretStore::default()),
//!         std::fs::read_to_string("templates/cloud-config.yaml")?,
//!     );
//!
//!     let report = orchestrator.apply(&topology, &CancellationToken::new()).await?;
//!     for node in report.nodes() {
//!         println!("{} {}", node.name, node.private_ip);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod loadbalancer;
pub mod orchestrator;
pub mod providers;
pub mod reconcile;
pub mod registry;
pub mod secrets;
pub mod sequencer;
pub mod topology;

pub use config::ProvisionerConfig;
pub use error::{ConfigError, ProvisionError};
pub use orchestrator::{ApplyReport, Orchestrator, PlannedNode};
pub use providers::{CloudProvider, HetznerCloud, ProviderError};
pub use registry::{DeviceRegistry, RegistryError, Tailscale};
pub use secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
pub use topology::{NodeSpec, ProvisionedNode, Role, Topology};
