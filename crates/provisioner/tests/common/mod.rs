//! In-memory provider and registry used by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use provisioner::providers::{
    CloudProvider, CreateFirewallRequest, CreateInstanceRequest, CreateLoadBalancerRequest,
    CreateNetworkRequest, CreateSubnetRequest, Firewall, Instance, InstanceSetup, InstanceStatus,
    LoadBalancer, LoadBalancerService, Network, PlacementGroup, PrivateAddress, Protection,
    ProviderError, Subnet,
};
use provisioner::registry::{
    AuthKey, AuthKeyRequest, DeviceRegistry, RegistryDevice, RegistryError, TagFilter,
};
use provisioner::secrets::{
    StaticSecretStore, K3S_TOKEN, S3_ACCESS_KEY, S3_SECRET_KEY, TAILSCALE_OAUTH_CLIENT_ID,
    TAILSCALE_OAUTH_CLIENT_SECRET,
};
use provisioner::topology::{NodeSpec, Role, Topology};
use provisioner::Orchestrator;

// =============================================================================
// Fake cloud provider
// =============================================================================

/// One `create_instance` call.
#[derive(Debug, Clone)]
pub struct CreateRecord {
    pub name: String,
    pub user_data: String,
    pub private_ip: std::net::Ipv4Addr,
    pub placement_group_id: Option<u64>,
    pub delete_protection: bool,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct CloudState {
    calls: Vec<String>,
    instances: BTreeMap<u64, Instance>,
    creates: Vec<CreateRecord>,
    deletes: Vec<String>,
    targets: Vec<(u64, u64, bool)>,
}

/// Network id every fake network gets.
pub const NETWORK_ID: u64 = 1;

/// Cloud provider backed by a map of instances.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    next_id: AtomicU64,
    /// Simulated creation time per instance.
    pub create_delay: Duration,
    /// Instance names whose creation fails.
    pub fail_create: Vec<String>,
    /// Reject load balancer network attachment.
    pub fail_lb_network: bool,
    /// Instance names that carry delete protection.
    pub protected: Vec<String>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(100),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.fail_create.push(name.to_string());
        self
    }

    pub fn rejecting_lb_network(mut self) -> Self {
        self.fail_lb_network = true;
        self
    }

    pub fn protecting(mut self, name: &str) -> Self {
        self.protected.push(name.to_string());
        self
    }

    fn protection_of(&self, name: &str) -> Protection {
        let protected = self.protected.iter().any(|p| p == name);
        Protection {
            delete: protected,
            rebuild: protected,
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }

    /// Add an instance as if a previous run had created it.
    pub fn seed(&self, topology: &Topology, role: Role, index: u32) -> u64 {
        let ip = topology.node_ip(role, index).unwrap();
        self.insert_seed(
            topology,
            role,
            index,
            InstanceStatus::Running,
            vec![PrivateAddress {
                network_id: NETWORK_ID,
                ip,
            }],
        )
    }

    /// Add an instance a previous run created but never attached or started.
    pub fn seed_incomplete(&self, topology: &Topology, role: Role, index: u32) -> u64 {
        self.insert_seed(topology, role, index, InstanceStatus::Off, vec![])
    }

    fn insert_seed(
        &self,
        topology: &Topology,
        role: Role,
        index: u32,
        status: InstanceStatus,
        private_net: Vec<PrivateAddress>,
    ) -> u64 {
        let spec = NodeSpec {
            role,
            index,
            desired_count: index + 1,
        };
        let id = self.id();
        let name = spec.instance_name(&topology.stage);
        let instance = Instance {
            id,
            protection: self.protection_of(&name),
            name,
            status,
            public_ipv4: Some(format!("203.0.113.{}", id % 250)),
            public_ipv6: None,
            private_net,
            labels: topology.instance_labels(&spec),
            created_at: None,
        };
        self.state.lock().unwrap().instances.insert(id, instance);
        id
    }

    pub fn instance(&self, id: u64) -> Option<Instance> {
        self.state.lock().unwrap().instances.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn creates(&self) -> Vec<CreateRecord> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn targets(&self) -> Vec<(u64, u64, bool)> {
        self.state.lock().unwrap().targets.clone()
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .map(|i| i.name.clone())
            .collect()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network, ProviderError> {
        self.record(format!("create_network {}", req.name));
        Ok(Network {
            id: NETWORK_ID,
            name: req.name,
            ip_range: req.ip_range,
            subnets: vec![],
        })
    }

    async fn create_subnet(&self, req: CreateSubnetRequest) -> Result<Subnet, ProviderError> {
        self.record(format!("create_subnet {}", req.ip_range));
        Ok(Subnet {
            network_id: req.network_id,
            ip_range: req.ip_range,
            network_zone: req.network_zone,
        })
    }

    async fn create_firewall(
        &self,
        req: CreateFirewallRequest,
    ) -> Result<Firewall, ProviderError> {
        self.record(format!("create_firewall {}", req.name));
        Ok(Firewall {
            id: 2,
            name: req.name,
        })
    }

    async fn create_placement_group(
        &self,
        name: &str,
        _labels: BTreeMap<String, String>,
    ) -> Result<PlacementGroup, ProviderError> {
        self.record(format!("create_placement_group {name}"));
        Ok(PlacementGroup {
            id: self.id(),
            name: name.to_string(),
        })
    }

    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer, ProviderError> {
        self.record(format!("create_load_balancer {}", req.name));
        let id = self.id();
        Ok(LoadBalancer {
            id,
            name: req.name,
            public_ipv4: Some(format!("198.51.100.{}", id % 250)),
            networks: vec![],
        })
    }

    async fn attach_load_balancer_network(
        &self,
        load_balancer_id: u64,
        _network_id: u64,
    ) -> Result<(), ProviderError> {
        self.record(format!("attach_load_balancer_network {load_balancer_id}"));
        if self.fail_lb_network {
            return Err(ProviderError::Api {
                status: 422,
                code: "invalid_input".to_string(),
                message: "network zone mismatch".to_string(),
            });
        }
        Ok(())
    }

    async fn add_load_balancer_service(
        &self,
        load_balancer_id: u64,
        _service: &LoadBalancerService,
    ) -> Result<(), ProviderError> {
        self.record(format!("add_load_balancer_service {load_balancer_id}"));
        Ok(())
    }

    async fn attach_load_balancer_target(
        &self,
        load_balancer_id: u64,
        instance_id: u64,
        use_private_ip: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("attach_load_balancer_target {load_balancer_id}"));
        state
            .targets
            .push((load_balancer_id, instance_id, use_private_ip));
        Ok(())
    }

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, ProviderError> {
        self.record(format!("create_instance {}", req.name));
        let started = Instant::now();
        tokio::time::sleep(self.create_delay).await;
        let finished = Instant::now();

        if self.fail_create.contains(&req.name) {
            return Err(ProviderError::Api {
                status: 412,
                code: "resource_unavailable".to_string(),
                message: "server type unavailable".to_string(),
            });
        }

        let id = self.id();
        let instance = Instance {
            id,
            name: req.name.clone(),
            status: InstanceStatus::Running,
            public_ipv4: Some(format!("203.0.113.{}", id % 250)),
            public_ipv6: None,
            private_net: vec![PrivateAddress {
                network_id: req.network_id,
                ip: req.private_ip,
            }],
            protection: Protection {
                delete: req.delete_protection,
                rebuild: req.rebuild_protection,
            },
            labels: req.labels.clone(),
            created_at: None,
        };

        let mut state = self.state.lock().unwrap();
        state.instances.insert(id, instance.clone());
        state.creates.push(CreateRecord {
            name: req.name,
            user_data: req.user_data.expose_secret().to_string(),
            private_ip: req.private_ip,
            placement_group_id: req.placement_group_id,
            delete_protection: req.delete_protection,
            started,
            finished,
        });
        Ok(instance)
    }

    async fn complete_instance(
        &self,
        instance: Instance,
        setup: &InstanceSetup,
    ) -> Result<Instance, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("complete_instance {}", instance.name));
        let stored = state
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| ProviderError::NotFound(instance.name.clone()))?;
        stored.private_net = vec![PrivateAddress {
            network_id: setup.network_id,
            ip: setup.private_ip,
        }];
        stored.protection.delete |= setup.delete_protection;
        stored.protection.rebuild |= setup.rebuild_protection;
        stored.status = InstanceStatus::Running;
        Ok(stored.clone())
    }

    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete_instance {id}"));
        if let Some(instance) = state.instances.get(&id) {
            if instance.protection.delete {
                return Err(ProviderError::Protected(instance.name.clone()));
            }
        }
        if let Some(instance) = state.instances.remove(&id) {
            state.deletes.push(instance.name);
        }
        Ok(())
    }

    async fn list_instances(&self, label_selector: &str) -> Result<Vec<Instance>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list_instances {label_selector}"));
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        Ok(state
            .instances
            .values()
            .filter(|instance| {
                wanted
                    .iter()
                    .all(|(k, v)| instance.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }
}

// =============================================================================
// Fake device registry
// =============================================================================

#[derive(Default)]
struct RegistryState {
    devices: Vec<RegistryDevice>,
    keys: Vec<AuthKeyRequest>,
    deleted: Vec<String>,
}

/// Device registry backed by a list.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, hostname: &str, tags: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = format!("n{}", state.devices.len() + 1);
            state.devices.push(RegistryDevice {
                id,
                hostname: hostname.to_string(),
                name: format!("{hostname}.tail1234.ts.net"),
                tags: tags.iter().map(ToString::to_string).collect(),
            });
        }
        self
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .iter()
            .map(|d| d.hostname.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn keys(&self) -> Vec<AuthKeyRequest> {
        self.state.lock().unwrap().keys.clone()
    }
}

#[async_trait]
impl DeviceRegistry for FakeRegistry {
    async fn list_devices(&self, filter: &TagFilter) -> Result<Vec<RegistryDevice>, RegistryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn delete_device(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.devices.iter().position(|d| d.id == id) {
            let device = state.devices.remove(pos);
            state.deleted.push(device.hostname);
        }
        Ok(())
    }

    async fn create_auth_key(&self, req: AuthKeyRequest) -> Result<AuthKey, RegistryError> {
        let mut state = self.state.lock().unwrap();
        state.keys.push(req);
        let n = state.keys.len();
        Ok(AuthKey {
            id: format!("k{n}"),
            key: SecretString::from(format!("tskey-auth-{n}")),
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Template touching every kind of value.
pub const TEMPLATE: &str = "role=${ROLE}\nip=${NODE_IP}\napi=${SERVER_API}\nhost=${TAILSCALE_HOSTNAME}\nkey=${REGISTRATION_TAILNET_AUTH_KEY}\ntoken=${K3S_TOKEN}\n";

pub fn secrets() -> StaticSecretStore {
    StaticSecretStore::new()
        .with(K3S_TOKEN, "k3s-token")
        .with(TAILSCALE_OAUTH_CLIENT_ID, "oauth-id")
        .with(TAILSCALE_OAUTH_CLIENT_SECRET, "oauth-secret")
        .with(S3_ACCESS_KEY, "s3-access")
        .with(S3_SECRET_KEY, "s3-secret")
}

pub fn orchestrator(cloud: &Arc<FakeCloud>, registry: &Arc<FakeRegistry>) -> Orchestrator {
    Orchestrator::new(
        cloud.clone(),
        registry.clone(),
        Arc::new(secrets()),
        TEMPLATE,
    )
}
