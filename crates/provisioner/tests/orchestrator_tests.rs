//! Provisioning runs against the in-memory cloud and registry.
//!
//! Covers:
//! - Validation before any provider call
//! - Bootstrap-first ordering and per-role sequencing
//! - Scale-down and registry reconciliation
//! - Failure isolation between roles
//! - Load balancer registration

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{orchestrator, secrets, FakeCloud, FakeRegistry, NETWORK_ID, TEMPLATE};
use provisioner::loadbalancer::AttachmentError;
use provisioner::providers::{InstanceStatus, ProviderError};
use provisioner::{ConfigError, Orchestrator, ProvisionError, Role, Topology};

const DEV_TAGS: &[&str] = &["tag:hetzner", "tag:dev"];

fn dev(control_plane: u32, workers: u32) -> Topology {
    Topology::for_stage("dev", false).with_counts(control_plane, workers)
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_too_many_control_plane_nodes_makes_no_calls() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());

    let err = orchestrator(&cloud, &registry)
        .apply(&dev(11, 0), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::TooManyControlPlaneNodes { count: 11, max: 10 })
    ));
    assert!(err
        .to_string()
        .contains("You can only have 10 control plane nodes"));
    assert!(cloud.calls().is_empty());
    assert!(registry.keys().is_empty());
}

#[tokio::test]
async fn test_workers_without_control_plane_rejected() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());

    let err = orchestrator(&cloud, &registry)
        .apply(&dev(0, 2), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Config(ConfigError::WorkersWithoutControlPlane { workers: 2 })
    ));
    assert!(cloud.calls().is_empty());
}

// =============================================================================
// Fresh cluster
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fresh_cluster_orders_nodes() {
    let cloud = Arc::new(FakeCloud::new().with_delay(Duration::from_secs(10)));
    let registry = Arc::new(FakeRegistry::new());

    let report = orchestrator(&cloud, &registry)
        .apply(&dev(3, 2), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.nodes().count(), 5);

    let creates = cloud.creates();
    let find = |name: &str| {
        creates
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("{name} was not created"))
    };
    let bootstrap = find("dev-control-plane-server-0");
    let cp1 = find("dev-control-plane-server-1");
    let cp2 = find("dev-control-plane-server-2");
    let w0 = find("dev-worker-server-0");
    let w1 = find("dev-worker-server-1");

    // Bootstrap first, then each role strictly in index order
    assert_eq!(creates[0].name, bootstrap.name);
    assert!(cp1.started >= bootstrap.finished);
    assert!(cp2.started >= cp1.finished);
    assert!(w0.started >= bootstrap.finished);
    assert!(w1.started >= w0.finished);

    // Roles advance concurrently
    assert!(w0.started < cp1.finished);

    assert_eq!(bootstrap.private_ip, Ipv4Addr::new(10, 0, 1, 10));
    assert_eq!(cp2.private_ip, Ipv4Addr::new(10, 0, 1, 12));
    assert_eq!(w1.private_ip, Ipv4Addr::new(10, 0, 1, 21));
    assert!(creates.iter().all(|c| c.placement_group_id.is_some()));
    assert!(creates.iter().all(|c| !c.delete_protection));
}

#[tokio::test]
async fn test_user_data_points_at_bootstrap_node() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());

    orchestrator(&cloud, &registry)
        .apply(&dev(2, 1), &CancellationToken::new())
        .await
        .unwrap();

    let creates = cloud.creates();
    let user_data = |name: &str| {
        creates
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.user_data.clone())
            .unwrap()
    };

    let bootstrap = user_data("dev-control-plane-server-0");
    assert!(bootstrap.contains("role=bootstrap"));
    assert!(bootstrap.contains("api=https://10.0.1.10:6443"));

    let server = user_data("dev-control-plane-server-1");
    assert!(server.contains("role=server"));
    assert!(server.contains("ip=10.0.1.11"));

    let worker = user_data("dev-worker-server-0");
    assert!(worker.contains("role=worker"));
    assert!(worker.contains("ip=10.0.1.20"));
    assert!(worker.contains("api=https://10.0.1.10:6443"));
    assert!(worker.contains("host=dev-hetzner-worker-server-0"));
    assert!(worker.contains("key=tskey-auth-"));
    assert!(worker.contains("token=k3s-token"));

    let keys = registry.keys();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| !k.reusable && k.preauthorized));
    assert!(keys
        .iter()
        .all(|k| k.tags.contains(&"tag:dev".to_string())));
}

#[tokio::test]
async fn test_production_enables_protection() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let topology = Topology::for_stage("prod", true).with_counts(1, 0);

    let report = orchestrator(&cloud, &registry)
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(cloud.creates().iter().all(|c| c.delete_protection));
    assert_eq!(report.load_balancers.len(), 1);
}

#[tokio::test]
async fn test_rerun_adopts_existing_instances() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let orchestrator = orchestrator(&cloud, &registry);
    let topology = dev(2, 1);

    orchestrator
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();
    let report = orchestrator
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.nodes().count(), 3);
    assert_eq!(cloud.creates().len(), 3);
    assert_eq!(registry.keys().len(), 3);
    assert!(cloud.deletes().is_empty());
}

#[tokio::test]
async fn test_rerun_finishes_incomplete_instance() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let topology = dev(1, 1);
    let id = cloud.seed_incomplete(&topology, Role::ControlPlane, 0);

    let report = orchestrator(&cloud, &registry)
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(cloud
        .calls()
        .contains(&"complete_instance dev-control-plane-server-0".to_string()));

    let instance = cloud.instance(id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(
        instance.private_ip_on(NETWORK_ID),
        Some(Ipv4Addr::new(10, 0, 1, 10))
    );

    let bootstrap = &report.rollout(Role::ControlPlane).unwrap().nodes[0];
    assert_eq!(bootstrap.instance_id, id);

    // Only the worker was created and needed a registration key
    let created: Vec<String> = cloud.creates().into_iter().map(|c| c.name).collect();
    assert_eq!(created, vec!["dev-worker-server-0"]);
    assert_eq!(registry.keys().len(), 1);
}

// =============================================================================
// Scale down and reconciliation
// =============================================================================

#[tokio::test]
async fn test_scale_to_zero_deletes_stage_nodes() {
    let cloud = Arc::new(FakeCloud::new());
    let topology = dev(0, 0);
    cloud.seed(&topology, Role::ControlPlane, 0);
    cloud.seed(&topology, Role::Worker, 0);
    cloud.seed(&topology, Role::Worker, 1);

    let registry = Arc::new(
        FakeRegistry::new()
            .with_device("dev-hetzner-control-plane-server-0", DEV_TAGS)
            .with_device("dev-hetzner-worker-server-0", DEV_TAGS)
            .with_device("dev-hetzner-worker-server-1", DEV_TAGS)
            .with_device("prod-hetzner-worker-server-0", &["tag:hetzner", "tag:prod"]),
    );

    let report = orchestrator(&cloud, &registry)
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.deleted,
        vec![
            "dev-worker-server-1",
            "dev-worker-server-0",
            "dev-control-plane-server-0"
        ]
    );
    assert!(cloud.instance_names().is_empty());
    assert!(cloud.creates().is_empty());

    let mut deleted = registry.deleted();
    deleted.sort();
    assert_eq!(
        deleted,
        vec![
            "dev-hetzner-control-plane-server-0",
            "dev-hetzner-worker-server-0",
            "dev-hetzner-worker-server-1"
        ]
    );
    assert_eq!(registry.hostnames(), vec!["prod-hetzner-worker-server-0"]);
    assert!(report.is_success());
}

#[tokio::test]
async fn test_scale_down_keeps_lower_slots() {
    let cloud = Arc::new(FakeCloud::new());
    let seeded = dev(1, 3);
    cloud.seed(&seeded, Role::ControlPlane, 0);
    for index in 0..3 {
        cloud.seed(&seeded, Role::Worker, index);
    }
    let registry = Arc::new(FakeRegistry::new());

    let report = orchestrator(&cloud, &registry)
        .apply(&dev(1, 1), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.deleted,
        vec!["dev-worker-server-2", "dev-worker-server-1"]
    );
    assert_eq!(
        cloud.instance_names(),
        vec!["dev-control-plane-server-0", "dev-worker-server-0"]
    );
    assert!(cloud.creates().is_empty());
}

#[tokio::test]
async fn test_protected_instance_halts_teardown() {
    let cloud = Arc::new(FakeCloud::new().protecting("dev-worker-server-2"));
    let seeded = dev(1, 3);
    cloud.seed(&seeded, Role::ControlPlane, 0);
    for index in 0..3 {
        cloud.seed(&seeded, Role::Worker, index);
    }
    let registry = Arc::new(FakeRegistry::new());

    let report = orchestrator(&cloud, &registry)
        .apply(&dev(1, 1), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.deleted.is_empty());
    assert_eq!(report.teardown_failures.len(), 1);
    assert!(matches!(
        &report.teardown_failures[0],
        ProvisionError::Provisioning {
            role: Role::Worker,
            index: 2,
            source: ProviderError::Protected(name),
        } if name == "dev-worker-server-2"
    ));

    // The protected node is never shut down, and worker 1 is kept too
    assert!(!cloud.calls().iter().any(|c| c.starts_with("delete_instance")));
    assert_eq!(cloud.instance_names().len(), 4);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_reconcile_registry_deletes_orphan() {
    let registry = Arc::new(
        FakeRegistry::new()
            .with_device("dev-hetzner-control-plane-server-0", DEV_TAGS)
            .with_device("dev-hetzner-worker-server-0", DEV_TAGS)
            .with_device("dev-hetzner-worker-server-1", DEV_TAGS)
            .with_device("laptop", &["tag:hetzner"]),
    );

    let report = Orchestrator::reconcile_registry(&*registry, &dev(1, 1))
        .await
        .unwrap();

    assert_eq!(report.deleted, vec!["dev-hetzner-worker-server-1"]);
    assert_eq!(report.kept.len(), 2);
    assert!(registry.hostnames().contains(&"laptop".to_string()));
}

#[tokio::test]
async fn test_reconcile_registry_validates_topology() {
    let registry =
        Arc::new(FakeRegistry::new().with_device("dev-hetzner-worker-server-0", DEV_TAGS));

    let err = Orchestrator::reconcile_registry(&*registry, &dev(0, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Config(_)));
    assert!(registry.deleted().is_empty());
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_bootstrap_failure_is_fatal() {
    let cloud = Arc::new(FakeCloud::new().failing("dev-control-plane-server-0"));
    let registry = Arc::new(FakeRegistry::new());

    let err = orchestrator(&cloud, &registry)
        .apply(&dev(3, 2), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Provisioning {
            role: Role::ControlPlane,
            index: 0,
            ..
        }
    ));
    let attempts = cloud
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_instance"))
        .count();
    assert_eq!(attempts, 1);
    assert!(cloud.instance_names().is_empty());
}

#[tokio::test]
async fn test_worker_failure_halts_only_workers() {
    let cloud = Arc::new(FakeCloud::new().failing("dev-worker-server-1"));
    let registry = Arc::new(FakeRegistry::new());

    let report = orchestrator(&cloud, &registry)
        .apply(&dev(3, 3), &CancellationToken::new())
        .await
        .unwrap();

    let control_plane = report.rollout(Role::ControlPlane).unwrap();
    assert!(control_plane.is_complete());
    assert_eq!(control_plane.nodes.len(), 3);

    let workers = report.rollout(Role::Worker).unwrap();
    assert_eq!(workers.nodes.len(), 1);
    assert!(matches!(
        workers.failure,
        Some(ProvisionError::Provisioning {
            role: Role::Worker,
            index: 1,
            ..
        })
    ));
    assert_eq!(workers.skipped, vec![2]);

    assert!(!cloud
        .instance_names()
        .contains(&"dev-worker-server-2".to_string()));
    assert!(report.reconcile.is_some());
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_strict_template_rejects_unknown_placeholder() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let orchestrator = Orchestrator::new(
        cloud.clone(),
        registry.clone(),
        Arc::new(secrets()),
        format!("{TEMPLATE}extra=${{NOT_A_KEY}}\n"),
    )
    .with_strict_template(true);

    let err = orchestrator
        .apply(&dev(1, 0), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisionError::Template {
            role: Role::ControlPlane,
            index: 0,
            ..
        }
    ));
    assert!(cloud.creates().is_empty());
}

#[tokio::test]
async fn test_unknown_placeholder_renders_empty() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let orchestrator = Orchestrator::new(
        cloud.clone(),
        registry.clone(),
        Arc::new(secrets()),
        "extra=${NOT_A_KEY};role=${ROLE}",
    );

    orchestrator
        .apply(&dev(1, 0), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cloud.creates()[0].user_data, "extra=;role=bootstrap");
}

#[tokio::test]
async fn test_missing_secret_fails_node() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let orchestrator = Orchestrator::new(
        cloud.clone(),
        registry.clone(),
        Arc::new(provisioner::StaticSecretStore::new()),
        TEMPLATE,
    );

    let err = orchestrator
        .apply(&dev(1, 0), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Secret { index: 0, .. }));
    assert!(cloud.creates().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new().with_device("dev-hetzner-old-0", DEV_TAGS));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator(&cloud, &registry)
        .apply(&dev(2, 2), &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(cloud.creates().is_empty());
    assert!(report.reconcile.is_none());
    assert!(registry.deleted().is_empty());
    assert!(!report.is_success());
}

// =============================================================================
// Load balancers
// =============================================================================

#[tokio::test]
async fn test_nodes_registered_with_every_load_balancer() {
    let cloud = Arc::new(FakeCloud::new());
    let registry = Arc::new(FakeRegistry::new());
    let mut topology = dev(1, 2);
    topology.load_balancer.count = 2;

    let report = orchestrator(&cloud, &registry)
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.load_balancers.len(), 2);
    assert!(report
        .load_balancers
        .contains_key("k3s-public-dev-load-balancer-1"));

    let targets = cloud.targets();
    assert_eq!(targets.len(), 6);
    assert!(targets.iter().all(|(_, _, private)| *private));
}

#[tokio::test]
async fn test_detached_load_balancer_reported_per_node() {
    let cloud = Arc::new(FakeCloud::new().rejecting_lb_network());
    let registry = Arc::new(FakeRegistry::new());
    let mut topology = dev(1, 1);
    topology.load_balancer.count = 1;

    let report = orchestrator(&cloud, &registry)
        .apply(&topology, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.nodes().count(), 2);
    assert_eq!(report.attachment_failures.len(), 2);
    assert!(report
        .attachment_failures
        .iter()
        .all(|f| matches!(f.error, AttachmentError::NetworkNotAttached)));
    assert!(cloud.targets().is_empty());
    assert!(!report.is_success());
}
