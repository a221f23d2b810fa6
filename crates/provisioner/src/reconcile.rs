//! Removal of orphaned tailnet devices.
//!
//! A device is an orphan when it carries the stage's tags but its hostname
//! is not one the current topology expects. Orphans are left behind when a
//! node is deleted or recreated.

use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::{info, warn};

use crate::registry::{DeviceRegistry, RegistryDevice, RegistryError, TagFilter};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Hostnames of deleted devices.
    pub deleted: Vec<String>,
    /// Hostnames whose deletion failed.
    pub failed: Vec<(String, RegistryError)>,
    /// Hostnames of matching devices that are still expected.
    pub kept: Vec<String>,
}

impl ReconcileReport {
    /// Whether every orphan was removed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete every device matching `filter` whose hostname is not expected.
///
/// Deletions run concurrently; a failed deletion is recorded and never
/// stops the others.
///
/// # Errors
/// Returns an error only if the device list cannot be fetched.
pub async fn reconcile(
    registry: &dyn DeviceRegistry,
    expected: &BTreeSet<String>,
    filter: &TagFilter,
) -> Result<ReconcileReport, RegistryError> {
    let devices = registry.list_devices(filter).await?;

    let (kept, orphans): (Vec<RegistryDevice>, Vec<RegistryDevice>) = devices
        .into_iter()
        .filter(|device| filter.matches(device))
        .partition(|device| expected.contains(&device.hostname));

    let results = join_all(
        orphans
            .iter()
            .map(|device| registry.delete_device(&device.id)),
    )
    .await;

    let mut report = ReconcileReport {
        kept: kept.into_iter().map(|device| device.hostname).collect(),
        ..ReconcileReport::default()
    };
    for (device, result) in orphans.into_iter().zip(results) {
        match result {
            Ok(()) => report.deleted.push(device.hostname),
            Err(e) => report.failed.push((device.hostname, e)),
        }
    }

    if !report.deleted.is_empty() {
        info!(devices = ?report.deleted, "Deleted devices from tailnet");
    }
    if !report.failed.is_empty() {
        let names: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
        warn!(devices = ?names, "Failed to delete devices from tailnet");
    }
    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        kept = report.kept.len(),
        "Registry reconciled"
    );

    Ok(report)
}
