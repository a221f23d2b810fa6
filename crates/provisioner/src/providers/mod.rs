//! Cloud provider abstractions.

pub mod hetzner;
mod traits;

pub use traits::{
    CloudProvider, CreateFirewallRequest, CreateInstanceRequest, CreateLoadBalancerRequest,
    CreateNetworkRequest, CreateSubnetRequest, Firewall, FirewallRule, HealthCheck, Instance,
    InstanceSetup, InstanceStatus, LoadBalancer, LoadBalancerService, Network, PlacementGroup,
    PrivateAddress, Protection, ProviderError, Subnet,
};

pub use hetzner::HetznerCloud;
