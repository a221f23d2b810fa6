//! End-to-end provisioning pass.
//!
//! [`Orchestrator::apply`] validates the topology, ensures the shared
//! infrastructure, removes surplus instances, creates the bootstrap node,
//! rolls out the remaining control-plane and worker nodes concurrently,
//! registers nodes with the load balancers and finally removes orphaned
//! tailnet devices.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::{render, render_strict, BootstrapContext, StorageSettings};
use crate::error::{ConfigError, ProvisionError};
use crate::loadbalancer::{self, AttachmentFailure, LoadBalancerHandle};
use crate::providers::{
    CloudProvider, CreateFirewallRequest, CreateInstanceRequest, CreateNetworkRequest,
    CreateSubnetRequest, Instance, InstanceSetup, ProviderError,
};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::registry::{AuthKeyRequest, DeviceRegistry, RegistryError, TagFilter};
use crate::secrets::SecretStore;
use crate::sequencer::{BootstrapNode, NodeLauncher, RoleRollout, Sequencer};
use crate::topology::{NodeRole, NodeSpec, ProvisionedNode, Role, Topology};

/// Name of the inbound firewall.
pub const FIREWALL_NAME: &str = "inbound";

/// A node the topology asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    /// Node role.
    pub role: Role,
    /// Slot within the role.
    pub index: u32,
    /// Instance name.
    pub name: String,
    /// Fixed address on the private network.
    pub private_ip: Ipv4Addr,
    /// Hostname the node registers on the tailnet.
    pub tailnet_hostname: String,
    /// `ROLE` in bootstrap data.
    pub node_role: NodeRole,
    /// Spread placement group.
    pub placement_group: String,
}

/// Outcome of [`Orchestrator::apply`].
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Per-role rollouts, control plane first.
    pub rollouts: Vec<RoleRollout>,
    /// Names of surplus instances that were deleted.
    pub deleted: Vec<String>,
    /// Deletions that failed and halted their role's teardown.
    pub teardown_failures: Vec<ProvisionError>,
    /// Load balancer registrations that failed.
    pub attachment_failures: Vec<AttachmentFailure>,
    /// Registry reconciliation, unless cancelled or failed.
    pub reconcile: Option<ReconcileReport>,
    /// Why registry reconciliation could not run.
    pub reconcile_error: Option<RegistryError>,
    /// `{name: public IPv4}` of the load balancers.
    pub load_balancers: BTreeMap<String, String>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl ApplyReport {
    /// Every ready node.
    pub fn nodes(&self) -> impl Iterator<Item = &ProvisionedNode> {
        self.rollouts.iter().flat_map(|rollout| rollout.nodes.iter())
    }

    /// Rollout of a role.
    #[must_use]
    pub fn rollout(&self, role: Role) -> Option<&RoleRollout> {
        self.rollouts.iter().find(|rollout| rollout.role == role)
    }

    /// Whether the cluster converged to the topology.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.rollouts.iter().all(RoleRollout::is_complete)
            && self.teardown_failures.is_empty()
            && self.attachment_failures.is_empty()
            && self.reconcile_error.is_none()
            && self.reconcile.as_ref().is_some_and(ReconcileReport::is_clean)
    }
}

/// Shared resources every node references.
#[derive(Debug, Clone)]
struct Infrastructure {
    network_id: u64,
    firewall_id: u64,
    placement_groups: BTreeMap<Role, Vec<u64>>,
    load_balancers: Vec<LoadBalancerHandle>,
}

/// Drives provisioning against a cloud provider and a device registry.
pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    registry: Arc<dyn DeviceRegistry>,
    secrets: Arc<dyn SecretStore>,
    template: String,
    strict_template: bool,
    storage: StorageSettings,
}

impl Orchestrator {
    /// Create an orchestrator rendering `template` for every node.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        registry: Arc<dyn DeviceRegistry>,
        secrets: Arc<dyn SecretStore>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            registry,
            secrets,
            template: template.into(),
            strict_template: false,
            storage: StorageSettings::default(),
        }
    }

    /// Fail a node whose template references unknown placeholders.
    #[must_use]
    pub fn with_strict_template(mut self, strict: bool) -> Self {
        self.strict_template = strict;
        self
    }

    /// Backup storage handed to every node.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageSettings) -> Self {
        self.storage = storage;
        self
    }

    /// Nodes the topology asks for. Makes no provider calls.
    ///
    /// # Errors
    /// Returns the topology's [`ConfigError`].
    pub fn plan(topology: &Topology) -> Result<Vec<PlannedNode>, ConfigError> {
        topology.validate()?;

        let mut planned = Vec::new();
        for role in Role::ALL {
            for spec in topology.node_specs(role) {
                planned.push(PlannedNode {
                    role,
                    index: spec.index,
                    name: spec.instance_name(&topology.stage),
                    private_ip: topology.node_ip(role, spec.index)?,
                    tailnet_hostname: spec.tailnet_hostname(&topology.stage),
                    node_role: spec.node_role(),
                    placement_group: topology.placement_group_name(role, spec.placement_group()),
                });
            }
        }
        Ok(planned)
    }

    /// Bring the cluster to the topology.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] before any provider call for an
    /// invalid topology, [`ProvisionError::Infrastructure`] if a shared
    /// resource cannot be ensured, and the bootstrap node's error if it
    /// cannot be created. Failures of other nodes are in the report.
    pub async fn apply(
        &self,
        topology: &Topology,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, ProvisionError> {
        topology.validate()?;
        info!(
            stage = %topology.stage,
            control_plane = topology.control_plane.count,
            workers = topology.worker.count,
            "Provisioning cluster"
        );

        let infra = self.ensure_infrastructure(topology).await?;
        let mut report = ApplyReport {
            load_balancers: loadbalancer::public_addresses(&infra.load_balancers),
            ..ApplyReport::default()
        };

        let instances = self
            .provider
            .list_instances(&topology.label_selector())
            .await
            .map_err(|source| ProvisionError::Infrastructure {
                resource: "instance list".to_string(),
                source,
            })?;
        let existing = self
            .scale_down(topology, instances, cancel, &mut report)
            .await;

        let launcher = InstanceLauncher {
            orchestrator: self,
            topology,
            infra: &infra,
            existing: &existing,
        };

        let mut control_plane = Sequencer::new(Role::ControlPlane, topology.control_plane.count);
        let bootstrap = control_plane.run_bootstrap(&launcher, cancel).await?;

        let mut workers = Sequencer::new(Role::Worker, topology.worker.count);
        if let Some(bootstrap) = bootstrap {
            workers = workers.with_bootstrap(bootstrap);
        }

        let (control_plane, workers) = tokio::join!(
            control_plane.run(&launcher, cancel),
            workers.run(&launcher, cancel)
        );
        report.cancelled |= control_plane.cancelled || workers.cancelled;
        report.rollouts = vec![control_plane, workers];

        if !infra.load_balancers.is_empty() {
            let provider = self.provider.as_ref();
            let failures = join_all(
                report
                    .nodes()
                    .map(|node| loadbalancer::attach(provider, node, &infra.load_balancers)),
            )
            .await;
            report.attachment_failures = failures.into_iter().flatten().collect();
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            warn!("Cancelled, skipping registry reconciliation");
        } else {
            match reconcile_devices(self.registry.as_ref(), topology).await {
                Ok(reconciled) => report.reconcile = Some(reconciled),
                Err(e) => {
                    error!(error = %e, "Registry reconciliation failed");
                    report.reconcile_error = Some(e);
                }
            }
        }

        info!(
            stage = %topology.stage,
            nodes = report.nodes().count(),
            deleted = report.deleted.len(),
            success = report.is_success(),
            "Provisioning finished"
        );
        Ok(report)
    }

    /// Remove orphaned tailnet devices. Needs only the registry, so it runs
    /// without cloud credentials.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] for an invalid topology and
    /// [`ProvisionError::Registry`] if devices cannot be listed.
    pub async fn reconcile_registry(
        registry: &dyn DeviceRegistry,
        topology: &Topology,
    ) -> Result<ReconcileReport, ProvisionError> {
        topology.validate()?;
        Ok(reconcile_devices(registry, topology).await?)
    }

    async fn ensure_infrastructure(
        &self,
        topology: &Topology,
    ) -> Result<Infrastructure, ProvisionError> {
        let infra_err = |resource: String| {
            move |source: ProviderError| ProvisionError::Infrastructure { resource, source }
        };
        let labels = topology.resource_labels();

        let network_name = topology.network_name();
        let network = self
            .provider
            .create_network(CreateNetworkRequest {
                name: network_name.clone(),
                ip_range: topology.network.ip_range.clone(),
                labels: labels.clone(),
            })
            .await
            .map_err(infra_err(format!("network {network_name}")))?;

        self.provider
            .create_subnet(CreateSubnetRequest {
                network_id: network.id,
                ip_range: topology.network.subnet.clone(),
                network_zone: topology.network.zone.clone(),
            })
            .await
            .map_err(infra_err(format!("subnet {}", topology.network.subnet)))?;

        let firewall = self
            .provider
            .create_firewall(CreateFirewallRequest {
                name: FIREWALL_NAME.to_string(),
                rules: topology.firewall_rules.clone(),
                labels: labels.clone(),
            })
            .await
            .map_err(infra_err(format!("firewall {FIREWALL_NAME}")))?;

        let mut placement_groups = BTreeMap::new();
        for role in Role::ALL {
            let mut ids = Vec::new();
            for group in 0..topology.placement_group_count(role) {
                let name = topology.placement_group_name(role, group);
                let pg = self
                    .provider
                    .create_placement_group(&name, labels.clone())
                    .await
                    .map_err(infra_err(format!("placement group {name}")))?;
                ids.push(pg.id);
            }
            placement_groups.insert(role, ids);
        }

        let load_balancers =
            loadbalancer::create_load_balancers(self.provider.as_ref(), topology, network.id)
                .await?;

        info!(
            network_id = network.id,
            firewall_id = firewall.id,
            load_balancers = load_balancers.len(),
            "Infrastructure ready"
        );
        Ok(Infrastructure {
            network_id: network.id,
            firewall_id: firewall.id,
            placement_groups,
            load_balancers,
        })
    }

    /// Delete instances at or beyond their role's desired count.
    ///
    /// Workers go first, highest index first. Returns the instances that
    /// remain, keyed by slot.
    async fn scale_down(
        &self,
        topology: &Topology,
        instances: Vec<Instance>,
        cancel: &CancellationToken,
        report: &mut ApplyReport,
    ) -> BTreeMap<(Role, u32), Instance> {
        let mut existing = BTreeMap::new();
        for instance in instances {
            match slot_of(&instance) {
                Some(slot) => {
                    existing.insert(slot, instance);
                }
                None => warn!(instance = %instance.name, "Managed instance without role/index labels"),
            }
        }

        for role in [Role::Worker, Role::ControlPlane] {
            let desired = topology.count(role);
            let surplus: Vec<u32> = existing
                .keys()
                .filter(|(r, index)| *r == role && *index >= desired)
                .map(|(_, index)| *index)
                .rev()
                .collect();

            for index in surplus {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return existing;
                }
                let Some(instance) = existing.get(&(role, index)) else {
                    continue;
                };
                // Protection is never lifted here; the node stays up and teardown halts
                let deleted = if instance.protection.delete {
                    Err(ProviderError::Protected(instance.name.clone()))
                } else {
                    info!(role = %role, index, instance = %instance.name, "Deleting surplus instance");
                    self.provider.delete_instance(instance.id).await
                };
                match deleted {
                    Ok(()) => {
                        if let Some(instance) = existing.remove(&(role, index)) {
                            report.deleted.push(instance.name);
                        }
                    }
                    Err(source) => {
                        error!(role = %role, index, error = %source, "Deletion failed, halting teardown");
                        report.teardown_failures.push(ProvisionError::Provisioning {
                            role,
                            index,
                            source,
                        });
                        break;
                    }
                }
            }
        }

        existing
    }
}

async fn reconcile_devices(
    registry: &dyn DeviceRegistry,
    topology: &Topology,
) -> Result<ReconcileReport, RegistryError> {
    let filter = TagFilter::new(topology.stage_tags());
    reconcile(registry, &topology.expected_hostnames(), &filter).await
}

/// Slot recorded in an instance's labels.
fn slot_of(instance: &Instance) -> Option<(Role, u32)> {
    let role = Role::from_slug(instance.labels.get("role")?)?;
    let index = instance.labels.get("index")?.parse().ok()?;
    Some((role, index))
}

/// Creates nodes through the cloud provider.
struct InstanceLauncher<'a> {
    orchestrator: &'a Orchestrator,
    topology: &'a Topology,
    infra: &'a Infrastructure,
    existing: &'a BTreeMap<(Role, u32), Instance>,
}

impl InstanceLauncher<'_> {
    fn setup(&self, private_ip: Ipv4Addr) -> InstanceSetup {
        InstanceSetup {
            network_id: self.infra.network_id,
            private_ip,
            delete_protection: self.topology.production,
            rebuild_protection: self.topology.production,
        }
    }

    fn provisioned(&self, spec: &NodeSpec, private_ip: Ipv4Addr, instance: Instance) -> ProvisionedNode {
        ProvisionedNode {
            role: spec.role,
            index: spec.index,
            private_ip,
            instance_id: instance.id,
            name: instance.name,
            public_ipv4: instance.public_ipv4,
            public_ipv6: instance.public_ipv6,
            tailnet_hostname: spec.tailnet_hostname(&self.topology.stage),
            is_bootstrap: spec.is_bootstrap(),
        }
    }

    async fn user_data(
        &self,
        spec: &NodeSpec,
        node_ip: Ipv4Addr,
        bootstrap_ip: Ipv4Addr,
    ) -> Result<SecretString, ProvisionError> {
        let (role, index) = (spec.role, spec.index);
        let orchestrator = self.orchestrator;

        let key = orchestrator
            .registry
            .create_auth_key(AuthKeyRequest::single_use(
                format!("hcloud {} {index} node reg", role.slug()),
                self.topology.node_tags(role),
            ))
            .await
            .map_err(|source| ProvisionError::RegistrationKey {
                role,
                index,
                source,
            })?;

        let context = BootstrapContext::resolve(
            self.topology,
            spec,
            node_ip,
            bootstrap_ip,
            key.key,
            &orchestrator.storage,
            orchestrator.secrets.as_ref(),
        )
        .await
        .map_err(|source| ProvisionError::Secret {
            role,
            index,
            source,
        })?;

        let values = context.to_values();
        let rendered = if orchestrator.strict_template {
            render_strict(&orchestrator.template, &values).map_err(|source| {
                ProvisionError::Template {
                    role,
                    index,
                    source,
                }
            })?
        } else {
            render(&orchestrator.template, &values)
        };
        Ok(SecretString::from(rendered))
    }
}

#[async_trait]
impl<'a> NodeLauncher for InstanceLauncher<'a> {
    async fn launch(
        &self,
        spec: &NodeSpec,
        bootstrap: Option<&BootstrapNode>,
    ) -> Result<ProvisionedNode, ProvisionError> {
        let (role, index) = (spec.role, spec.index);
        let node_ip = self.topology.node_ip(role, index)?;

        if let Some(instance) = self.existing.get(&(role, index)) {
            let setup = self.setup(node_ip);
            let instance = if setup.is_satisfied_by(instance) {
                info!(role = %role, index, instance = %instance.name, "Adopting existing instance");
                instance.clone()
            } else {
                warn!(
                    role = %role,
                    index,
                    instance = %instance.name,
                    status = %instance.status,
                    "Existing instance is incomplete, finishing its setup"
                );
                self.orchestrator
                    .provider
                    .complete_instance(instance.clone(), &setup)
                    .await
                    .map_err(|source| ProvisionError::Provisioning {
                        role,
                        index,
                        source,
                    })?
            };
            return Ok(self.provisioned(spec, node_ip, instance));
        }

        let bootstrap_ip = bootstrap.map_or(node_ip, |b| b.private_ip);
        let user_data = self.user_data(spec, node_ip, bootstrap_ip).await?;

        let placement_group_id = self
            .infra
            .placement_groups
            .get(&role)
            .and_then(|groups| groups.get(spec.placement_group() as usize))
            .copied();

        let topology = self.topology;
        let instance = self
            .orchestrator
            .provider
            .create_instance(CreateInstanceRequest {
                name: spec.instance_name(&topology.stage),
                server_type: topology.server.server_type.clone(),
                image: topology.server.image.clone(),
                location: topology.server.location.clone(),
                placement_group_id,
                firewall_ids: vec![self.infra.firewall_id],
                network_id: self.infra.network_id,
                private_ip: node_ip,
                labels: topology.instance_labels(spec),
                user_data,
                delete_protection: topology.production,
                rebuild_protection: topology.production,
            })
            .await
            .map_err(|source| ProvisionError::Provisioning {
                role,
                index,
                source,
            })?;

        Ok(self.provisioned(spec, node_ip, instance))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_plan() {
        let topology = Topology::for_stage("dev", false).with_counts(2, 11);
        let planned = Orchestrator::plan(&topology).unwrap();
        assert_eq!(planned.len(), 13);

        assert_eq!(planned[0].node_role, NodeRole::Bootstrap);
        assert_eq!(planned[0].private_ip, Ipv4Addr::new(10, 0, 1, 10));
        assert_eq!(planned[1].node_role, NodeRole::Server);

        let last = planned.last().unwrap();
        assert_eq!(last.name, "dev-worker-server-10");
        assert_eq!(last.private_ip, Ipv4Addr::new(10, 0, 1, 30));
        assert_eq!(last.placement_group, "dev-workers-1");
    }

    #[test]
    fn test_plan_rejects_invalid_topology() {
        let topology = Topology::for_stage("dev", false).with_counts(11, 0);
        assert!(matches!(
            Orchestrator::plan(&topology),
            Err(ConfigError::TooManyControlPlaneNodes { .. })
        ));
    }

    #[test]
    fn test_slot_of() {
        let instance = Instance {
            id: 1,
            name: "dev-worker-server-4".to_string(),
            status: crate::providers::InstanceStatus::Running,
            public_ipv4: None,
            public_ipv6: None,
            private_net: vec![],
            protection: crate::providers::Protection::default(),
            labels: BTreeMap::from([
                ("role".to_string(), "worker".to_string()),
                ("index".to_string(), "4".to_string()),
            ]),
            created_at: None,
        };
        assert_eq!(slot_of(&instance), Some((Role::Worker, 4)));

        let unlabelled = Instance {
            labels: BTreeMap::new(),
            ..instance
        };
        assert_eq!(slot_of(&unlabelled), None);
    }

    #[test]
    fn test_report_success() {
        let report = ApplyReport {
            reconcile: Some(ReconcileReport::default()),
            ..ApplyReport::default()
        };
        assert!(report.is_success());
        assert!(!ApplyReport::default().is_success());
    }

    #[test]
    fn test_expected_hostnames_used_for_reconcile() {
        let topology = Topology::for_stage("dev", false).with_counts(1, 1);
        let expected: BTreeSet<String> = topology.expected_hostnames();
        assert!(expected.contains("dev-hetzner-control-plane-server-0"));
        assert!(expected.contains("dev-hetzner-worker-server-0"));
        assert_eq!(
            TagFilter::new(topology.stage_tags()).tags,
            vec!["tag:hetzner", "tag:dev"]
        );
    }
}
