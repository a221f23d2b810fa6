//! Hetzner Cloud API client implementation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::models::{
    Action, ActionResponse, AddServiceBody, AddTargetBody, Algorithm, AttachToNetworkBody,
    ChangeProtectionBody, CreateFirewallBody, CreateLoadBalancerBody, CreateNetworkBody,
    CreatePlacementGroupBody, CreateServerBody, CreateServerResponse, ErrorResponse,
    FirewallListResponse, FirewallRef, FirewallResponse, HcloudLoadBalancer, HcloudNetwork,
    HcloudServer, HcloudSubnet, LoadBalancerListResponse, LoadBalancerResponse,
    NetworkListResponse, NetworkResponse, PlacementGroupListResponse, PlacementGroupResponse,
    PublicNetBody, ServerListResponse, ServerResponse, TargetServer,
};
use crate::providers::traits::{
    CloudProvider, CreateFirewallRequest, CreateInstanceRequest, CreateLoadBalancerRequest,
    CreateNetworkRequest, CreateSubnetRequest, Firewall, Instance, InstanceSetup, InstanceStatus,
    LoadBalancer, LoadBalancerService, Network, PlacementGroup, PrivateAddress, Protection,
    ProviderError, Subnet,
};

/// Base URL for the Hetzner Cloud API.
const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval when waiting for actions.
const POLL_INTERVAL_SECS: u64 = 2;

/// Upper bound for a single action to finish.
const ACTION_TIMEOUT_SECS: u64 = 600;

/// Page size for list requests.
const PER_PAGE: u32 = 50;

/// Error codes returned when the requested state already holds.
const ALREADY_DONE_CODES: &[&str] = &[
    "load_balancer_already_attached",
    "server_already_attached",
    "source_port_already_used",
    "target_already_defined",
];

/// Hetzner Cloud provider.
#[derive(Clone)]
pub struct HetznerCloud {
    /// HTTP client.
    client: Client,
    /// API token.
    token: SecretString,
    /// API base URL.
    base_url: String,
    /// Action polling interval.
    poll_interval: Duration,
}

impl HetznerCloud {
    /// Create a new Hetzner Cloud provider.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(token: SecretString) -> Result<Self, ProviderError> {
        Self::with_base_url(token, API_BASE_URL)
    }

    /// Create a provider talking to a different endpoint.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        token: SecretString,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
        })
    }

    /// Override the action polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(self.token.expose_secret())
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self
            .authed(self.client.get(&url))
            .query(query)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with a JSON body.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .authed(self.client.post(&url))
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request.
    async fn delete<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "DELETE request");

        let response = self.authed(self.client.delete(&url)).send().await?;

        Self::handle_response(response).await
    }

    /// Handle API response, parsing JSON or the error envelope.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            });
        }

        let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
            Ok(envelope) => (envelope.error.code, envelope.error.message),
            Err(_) => ("unknown".to_string(), text),
        };

        if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(message))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                code,
                message,
            })
        }
    }

    /// Whether an error means the requested change is already in place.
    fn is_already_done(err: &ProviderError) -> bool {
        matches!(err, ProviderError::Api { code, .. } if ALREADY_DONE_CODES.contains(&code.as_str()))
    }

    /// Run an action-returning POST and wait for the action.
    ///
    /// Errors meaning the change already holds are treated as success.
    async fn run_action<B: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ProviderError> {
        match self.post::<ActionResponse, B>(path, body).await {
            Ok(response) => self.wait_action(response.action).await,
            Err(e) if Self::is_already_done(&e) => {
                debug!(path = %path, error = %e, "Change already applied");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Poll an action until it finishes.
    async fn wait_action(&self, mut action: Action) -> Result<(), ProviderError> {
        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(ACTION_TIMEOUT_SECS);

        loop {
            match action.status.as_str() {
                "success" => {
                    debug!(action_id = action.id, command = %action.command, "Action finished");
                    return Ok(());
                }
                "error" => {
                    let message = action
                        .error
                        .map_or_else(|| "unknown error".to_string(), |e| e.message);
                    return Err(ProviderError::Action {
                        command: action.command,
                        message,
                    });
                }
                _ => {}
            }

            if start.elapsed() > timeout {
                return Err(ProviderError::Timeout(ACTION_TIMEOUT_SECS));
            }

            tokio::time::sleep(self.poll_interval).await;

            let response: ActionResponse = self.get(&format!("/actions/{}", action.id), &[]).await?;
            action = response.action;
            debug!(
                action_id = action.id,
                command = %action.command,
                progress = action.progress,
                elapsed_secs = start.elapsed().as_secs(),
                "Polling action status"
            );
        }
    }

    async fn find_network(&self, name: &str) -> Result<Option<HcloudNetwork>, ProviderError> {
        let response: NetworkListResponse =
            self.get("/networks", &[("name", name.to_string())]).await?;
        Ok(response.networks.into_iter().next())
    }

    async fn find_load_balancer(
        &self,
        name: &str,
    ) -> Result<Option<HcloudLoadBalancer>, ProviderError> {
        let response: LoadBalancerListResponse = self
            .get("/load_balancers", &[("name", name.to_string())])
            .await?;
        Ok(response.load_balancers.into_iter().next())
    }

    async fn find_server(&self, name: &str) -> Result<Option<HcloudServer>, ProviderError> {
        let response: ServerListResponse =
            self.get("/servers", &[("name", name.to_string())]).await?;
        Ok(response.servers.into_iter().next())
    }

    fn to_network(network: HcloudNetwork) -> Network {
        Network {
            id: network.id,
            name: network.name,
            ip_range: network.ip_range,
            subnets: network.subnets.into_iter().map(|s| s.ip_range).collect(),
        }
    }

    fn to_load_balancer(lb: HcloudLoadBalancer) -> LoadBalancer {
        LoadBalancer {
            id: lb.id,
            name: lb.name,
            public_ipv4: lb.public_net.and_then(|net| net.ipv4).and_then(|ip| ip.ip),
            networks: lb.private_net.iter().map(|net| net.network).collect(),
        }
    }

    /// Convert a Hetzner server to our Instance type.
    fn to_instance(server: HcloudServer) -> Instance {
        let status = match server.status.as_str() {
            "initializing" => InstanceStatus::Initializing,
            "starting" => InstanceStatus::Starting,
            "running" => InstanceStatus::Running,
            "stopping" => InstanceStatus::Stopping,
            "off" => InstanceStatus::Off,
            "deleting" => InstanceStatus::Deleting,
            "rebuilding" => InstanceStatus::Rebuilding,
            _ => InstanceStatus::Unknown,
        };

        let created_at = server
            .created
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let (public_ipv4, public_ipv6) = server.public_net.map_or((None, None), |net| {
            (
                net.ipv4.and_then(|ip| ip.ip),
                net.ipv6.and_then(|ip| ip.ip),
            )
        });

        Instance {
            id: server.id,
            name: server.name,
            status,
            public_ipv4,
            public_ipv6,
            private_net: server
                .private_net
                .iter()
                .filter_map(|net| {
                    Some(PrivateAddress {
                        network_id: net.network,
                        ip: net.ip.as_deref()?.parse::<Ipv4Addr>().ok()?,
                    })
                })
                .collect(),
            protection: Protection {
                delete: server.protection.delete,
                rebuild: server.protection.rebuild,
            },
            labels: server.labels,
            created_at,
        }
    }

    async fn get_instance(&self, id: u64) -> Result<Instance, ProviderError> {
        let response: ServerResponse = self.get(&format!("/servers/{id}"), &[]).await?;
        Ok(Self::to_instance(response.server))
    }

    async fn attach_server_network(
        &self,
        id: u64,
        network_id: u64,
        ip: Ipv4Addr,
    ) -> Result<(), ProviderError> {
        self.run_action(
            &format!("/servers/{id}/actions/attach_to_network"),
            &AttachToNetworkBody {
                network: network_id,
                ip: Some(ip.to_string()),
            },
        )
        .await
    }

    async fn protect_server(&self, id: u64, protection: Protection) -> Result<(), ProviderError> {
        self.run_action(
            &format!("/servers/{id}/actions/change_protection"),
            &ChangeProtectionBody {
                delete: protection.delete,
                rebuild: protection.rebuild,
            },
        )
        .await
    }

    async fn power_on(&self, id: u64) -> Result<(), ProviderError> {
        self.run_action(&format!("/servers/{id}/actions/poweron"), &serde_json::json!({}))
            .await
    }
}

#[async_trait]
impl CloudProvider for HetznerCloud {
    async fn create_network(&self, req: CreateNetworkRequest) -> Result<Network, ProviderError> {
        if let Some(existing) = self.find_network(&req.name).await? {
            debug!(network = %req.name, id = existing.id, "Network already exists");
            return Ok(Self::to_network(existing));
        }

        info!(network = %req.name, ip_range = %req.ip_range, "Creating network");
        let body = CreateNetworkBody {
            name: &req.name,
            ip_range: &req.ip_range,
            labels: &req.labels,
        };
        let response: NetworkResponse = self.post("/networks", &body).await?;
        Ok(Self::to_network(response.network))
    }

    async fn create_subnet(&self, req: CreateSubnetRequest) -> Result<Subnet, ProviderError> {
        let response: NetworkResponse = self
            .get(&format!("/networks/{}", req.network_id), &[])
            .await?;
        let present = response
            .network
            .subnets
            .iter()
            .any(|s| s.ip_range == req.ip_range);

        if present {
            debug!(subnet = %req.ip_range, "Subnet already exists");
        } else {
            info!(
                network_id = req.network_id,
                subnet = %req.ip_range,
                zone = %req.network_zone,
                "Adding subnet"
            );
            let body = HcloudSubnet {
                subnet_type: "cloud".to_string(),
                ip_range: req.ip_range.clone(),
                network_zone: req.network_zone.clone(),
            };
            self.run_action(&format!("/networks/{}/actions/add_subnet", req.network_id), &body)
                .await?;
        }

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
        let existing: FirewallListResponse = self
            .get("/firewalls", &[("name", req.name.clone())])
            .await?;
        if let Some(fw) = existing.firewalls.into_iter().next() {
            debug!(firewall = %req.name, id = fw.id, "Firewall already exists");
            return Ok(Firewall {
                id: fw.id,
                name: fw.name,
            });
        }

        info!(firewall = %req.name, rules = req.rules.len(), "Creating firewall");
        let body = CreateFirewallBody {
            name: &req.name,
            rules: &req.rules,
            labels: &req.labels,
        };
        let response: FirewallResponse = self.post("/firewalls", &body).await?;
        for action in response.actions {
            self.wait_action(action).await?;
        }

        Ok(Firewall {
            id: response.firewall.id,
            name: response.firewall.name,
        })
    }

    async fn create_placement_group(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<PlacementGroup, ProviderError> {
        let existing: PlacementGroupListResponse = self
            .get("/placement_groups", &[("name", name.to_string())])
            .await?;
        if let Some(group) = existing.placement_groups.into_iter().next() {
            debug!(placement_group = %name, id = group.id, "Placement group already exists");
            return Ok(PlacementGroup {
                id: group.id,
                name: group.name,
            });
        }

        info!(placement_group = %name, "Creating spread placement group");
        let body = CreatePlacementGroupBody {
            name,
            group_type: "spread",
            labels: &labels,
        };
        let response: PlacementGroupResponse = self.post("/placement_groups", &body).await?;

        Ok(PlacementGroup {
            id: response.placement_group.id,
            name: response.placement_group.name,
        })
    }

    async fn create_load_balancer(
        &self,
        req: CreateLoadBalancerRequest,
    ) -> Result<LoadBalancer, ProviderError> {
        if let Some(existing) = self.find_load_balancer(&req.name).await? {
            debug!(load_balancer = %req.name, id = existing.id, "Load balancer already exists");
            return Ok(Self::to_load_balancer(existing));
        }

        info!(
            load_balancer = %req.name,
            lb_type = %req.load_balancer_type,
            location = %req.location,
            "Creating load balancer"
        );
        let body = CreateLoadBalancerBody {
            name: &req.name,
            load_balancer_type: &req.load_balancer_type,
            location: &req.location,
            algorithm: Algorithm {
                algorithm_type: &req.algorithm,
            },
            labels: &req.labels,
        };
        let response: LoadBalancerResponse = self.post("/load_balancers", &body).await?;
        if let Some(action) = response.action {
            self.wait_action(action).await?;
        }

        Ok(Self::to_load_balancer(response.load_balancer))
    }

    async fn attach_load_balancer_network(
        &self,
        load_balancer_id: u64,
        network_id: u64,
    ) -> Result<(), ProviderError> {
        info!(load_balancer_id, network_id, "Attaching load balancer to network");
        let body = AttachToNetworkBody {
            network: network_id,
            ip: None,
        };
        self.run_action(
            &format!("/load_balancers/{load_balancer_id}/actions/attach_to_network"),
            &body,
        )
        .await
    }

    async fn add_load_balancer_service(
        &self,
        load_balancer_id: u64,
        service: &LoadBalancerService,
    ) -> Result<(), ProviderError> {
        info!(
            load_balancer_id,
            listen_port = service.listen_port,
            destination_port = service.destination_port,
            "Adding load balancer service"
        );
        let body = AddServiceBody {
            protocol: &service.protocol,
            listen_port: service.listen_port,
            destination_port: service.destination_port,
            proxyprotocol: service.proxyprotocol,
            health_check: &service.health_check,
        };
        self.run_action(
            &format!("/load_balancers/{load_balancer_id}/actions/add_service"),
            &body,
        )
        .await
    }

    async fn attach_load_balancer_target(
        &self,
        load_balancer_id: u64,
        instance_id: u64,
        use_private_ip: bool,
    ) -> Result<(), ProviderError> {
        debug!(load_balancer_id, instance_id, "Adding load balancer target");
        let body = AddTargetBody {
            target_type: "server",
            server: TargetServer { id: instance_id },
            use_private_ip,
        };
        self.run_action(
            &format!("/load_balancers/{load_balancer_id}/actions/add_target"),
            &body,
        )
        .await
    }

    async fn create_instance(&self, req: CreateInstanceRequest) -> Result<Instance, ProviderError> {
        if let Some(existing) = self.find_server(&req.name).await? {
            info!(server = %req.name, id = existing.id, "Server already exists");
            return self
                .complete_instance(Self::to_instance(existing), &req.setup())
                .await;
        }

        info!(
            server = %req.name,
            server_type = %req.server_type,
            location = %req.location,
            private_ip = %req.private_ip,
            "Creating server"
        );

        // Boot only once the private network is attached so cloud-init sees it.
        let body = CreateServerBody {
            name: &req.name,
            server_type: &req.server_type,
            image: &req.image,
            location: &req.location,
            placement_group: req.placement_group_id,
            firewalls: req
                .firewall_ids
                .iter()
                .map(|&id| FirewallRef { firewall: id })
                .collect(),
            labels: &req.labels,
            user_data: req.user_data.expose_secret(),
            public_net: PublicNetBody {
                enable_ipv4: true,
                enable_ipv6: true,
            },
            start_after_create: false,
        };
        let response: CreateServerResponse = self.post("/servers", &body).await?;
        let id = response.server.id;
        self.wait_action(response.action).await?;
        for action in response.next_actions {
            self.wait_action(action).await?;
        }

        self.attach_server_network(id, req.network_id, req.private_ip)
            .await?;

        if req.delete_protection || req.rebuild_protection {
            self.protect_server(
                id,
                Protection {
                    delete: req.delete_protection,
                    rebuild: req.rebuild_protection,
                },
            )
            .await?;
        }

        self.power_on(id).await?;

        let instance = self.get_instance(id).await?;
        info!(server = %instance.name, id, status = %instance.status, "Server created");
        Ok(instance)
    }

    async fn complete_instance(
        &self,
        instance: Instance,
        setup: &InstanceSetup,
    ) -> Result<Instance, ProviderError> {
        if setup.is_satisfied_by(&instance) {
            return Ok(instance);
        }
        let id = instance.id;
        warn!(server = %instance.name, id, status = %instance.status, "Completing server setup");

        match instance.private_ip_on(setup.network_id) {
            Some(ip) if ip == setup.private_ip => {}
            Some(ip) => {
                return Err(ProviderError::Config(format!(
                    "server {} is attached to network {} at {ip}, expected {}",
                    instance.name, setup.network_id, setup.private_ip
                )));
            }
            None => {
                self.attach_server_network(id, setup.network_id, setup.private_ip)
                    .await?;
            }
        }

        let protection = Protection {
            delete: instance.protection.delete || setup.delete_protection,
            rebuild: instance.protection.rebuild || setup.rebuild_protection,
        };
        if protection != instance.protection {
            self.protect_server(id, protection).await?;
        }

        match instance.status {
            InstanceStatus::Running | InstanceStatus::Starting => {}
            InstanceStatus::Off => self.power_on(id).await?,
            status => {
                return Err(ProviderError::UnexpectedState {
                    name: instance.name,
                    status,
                });
            }
        }

        let instance = self.get_instance(id).await?;
        info!(server = %instance.name, id, status = %instance.status, "Server setup completed");
        Ok(instance)
    }

    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError> {
        let instance = match self.get_instance(id).await {
            Ok(instance) => instance,
            Err(ProviderError::NotFound(_)) => {
                info!(server_id = id, "Server already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if instance.protection.delete {
            return Err(ProviderError::Protected(instance.name));
        }

        info!(server_id = id, "Shutting down server");
        match self
            .run_action(&format!("/servers/{id}/actions/shutdown"), &serde_json::json!({}))
            .await
        {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) => {
                info!(server_id = id, "Server already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        info!(server_id = id, "Deleting server");
        match self.delete::<ActionResponse>(&format!("/servers/{id}")).await {
            Ok(response) => self.wait_action(response.action).await,
            Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self, label_selector: &str) -> Result<Vec<Instance>, ProviderError> {
        let mut instances = Vec::new();
        let mut page = 1;

        loop {
            let response: ServerListResponse = self
                .get(
                    "/servers",
                    &[
                        ("label_selector", label_selector.to_string()),
                        ("page", page.to_string()),
                        ("per_page", PER_PAGE.to_string()),
                    ],
                )
                .await?;

            instances.extend(response.servers.into_iter().map(Self::to_instance));

            match response.meta.pagination.and_then(|p| p.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        debug!(label_selector = %label_selector, count = instances.len(), "Listed servers");
        Ok(instances)
    }
}
