//! Public load balancers in front of the cluster ingress.

use std::collections::BTreeMap;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::providers::{
    CloudProvider, CreateLoadBalancerRequest, HealthCheck, LoadBalancerService, ProviderError,
};
use crate::topology::{LoadBalancerConfig, ProvisionedNode, Topology};

/// Health check interval in seconds.
const HEALTH_CHECK_INTERVAL_SECS: u32 = 10;
/// Health check timeout in seconds.
const HEALTH_CHECK_TIMEOUT_SECS: u32 = 3;
/// Failed probes before a target is unhealthy.
const HEALTH_CHECK_RETRIES: u32 = 3;

/// A load balancer ready to receive targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerHandle {
    /// Provider identifier.
    pub id: u64,
    /// Name.
    pub name: String,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Whether the load balancer sits on the private network.
    pub network_attached: bool,
}

/// Why a node could not be registered with a load balancer.
#[derive(Error, Debug)]
pub enum AttachmentError {
    /// Private targets need the load balancer on the private network.
    #[error("load balancer is not attached to the private network")]
    NetworkNotAttached,

    /// The provider rejected the registration.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A failed node registration.
#[derive(Debug)]
pub struct AttachmentFailure {
    /// Load balancer name.
    pub load_balancer: String,
    /// Instance name.
    pub node: String,
    /// Cause.
    pub error: AttachmentError,
}

/// TCP service forwarding the public port to the ingress node port.
#[must_use]
pub fn service_for(config: &LoadBalancerConfig) -> LoadBalancerService {
    LoadBalancerService {
        protocol: "tcp".to_string(),
        listen_port: config.listen_port,
        destination_port: config.destination_port,
        proxyprotocol: config.proxy_protocol,
        health_check: HealthCheck {
            protocol: "tcp".to_string(),
            port: config.destination_port,
            interval: HEALTH_CHECK_INTERVAL_SECS,
            timeout: HEALTH_CHECK_TIMEOUT_SECS,
            retries: HEALTH_CHECK_RETRIES,
        },
    }
}

/// Ensure the configured load balancers exist with their service.
///
/// A failed network attachment is logged and recorded on the handle so that
/// target registration reports it per load balancer.
///
/// # Errors
/// Returns [`ProvisionError::Infrastructure`] if a load balancer or its
/// service cannot be created.
pub async fn create_load_balancers(
    provider: &dyn CloudProvider,
    topology: &Topology,
    network_id: u64,
) -> Result<Vec<LoadBalancerHandle>, ProvisionError> {
    let config = &topology.load_balancer;
    let service = service_for(config);
    let mut handles = Vec::with_capacity(config.count as usize);

    for index in 0..config.count {
        let name = topology.load_balancer_name(index);
        let infra_err = |source| ProvisionError::Infrastructure {
            resource: format!("load balancer {name}"),
            source,
        };

        let lb = provider
            .create_load_balancer(CreateLoadBalancerRequest {
                name: name.clone(),
                load_balancer_type: config.load_balancer_type.clone(),
                location: topology.server.location.clone(),
                algorithm: config.algorithm.as_str().to_string(),
                labels: topology.resource_labels(),
            })
            .await
            .map_err(infra_err)?;

        let network_attached = if lb.networks.contains(&network_id) {
            true
        } else {
            match provider.attach_load_balancer_network(lb.id, network_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(load_balancer = %name, error = %e, "Failed to attach load balancer to network");
                    false
                }
            }
        };

        provider
            .add_load_balancer_service(lb.id, &service)
            .await
            .map_err(infra_err)?;

        info!(
            load_balancer = %name,
            public_ipv4 = ?lb.public_ipv4,
            network_attached,
            "Load balancer ready"
        );
        handles.push(LoadBalancerHandle {
            id: lb.id,
            name: lb.name,
            public_ipv4: lb.public_ipv4,
            network_attached,
        });
    }

    Ok(handles)
}

/// Register a node with every load balancer concurrently.
///
/// Returns the registrations that failed; the others are unaffected.
pub async fn attach(
    provider: &dyn CloudProvider,
    node: &ProvisionedNode,
    load_balancers: &[LoadBalancerHandle],
) -> Vec<AttachmentFailure> {
    let results = join_all(load_balancers.iter().map(|lb| async move {
        if !lb.network_attached {
            return Err(AttachmentError::NetworkNotAttached);
        }
        provider
            .attach_load_balancer_target(lb.id, node.instance_id, true)
            .await
            .map_err(AttachmentError::from)
    }))
    .await;

    load_balancers
        .iter()
        .zip(results)
        .filter_map(|(lb, result)| {
            let error = result.err()?;
            warn!(load_balancer = %lb.name, node = %node.name, error = %error, "Failed to register target");
            Some(AttachmentFailure {
                load_balancer: lb.name.clone(),
                node: node.name.clone(),
                error,
            })
        })
        .collect()
}

/// `{name: public IPv4}` of the load balancers that have one.
#[must_use]
pub fn public_addresses(load_balancers: &[LoadBalancerHandle]) -> BTreeMap<String, String> {
    load_balancers
        .iter()
        .filter_map(|lb| Some((lb.name.clone(), lb.public_ipv4.clone()?)))
        .collect()
}
