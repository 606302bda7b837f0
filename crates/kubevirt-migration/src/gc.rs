//! Garbage collection of finalized migrations
//!
//! Only the newest finalized migrations are kept, cluster-wide, so that
//! recent outcomes stay visible to `kubectl get vmim` without the list
//! growing forever. Migrations that are still running are never touched.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info};

use kubevirt_common::crd::VirtualMachineInstanceMigration;
use kubevirt_common::metrics::GARBAGE_COLLECTED;
use kubevirt_common::Error;

use crate::controller::KubeClient;
use crate::store::ObjectStore;

/// Finalized migrations kept by default
pub const DEFAULT_FINALIZED_BUFFER: usize = 5;

/// Finalized migrations beyond the newest `keep`
///
/// Newest first by creation timestamp, then by namespace and name so the
/// choice is stable when timestamps collide. Migrations already being
/// deleted are skipped.
pub fn finalized_to_delete(
    migrations: &[Arc<VirtualMachineInstanceMigration>],
    keep: usize,
) -> Vec<Arc<VirtualMachineInstanceMigration>> {
    let mut finalized: Vec<_> = migrations
        .iter()
        .filter(|m| m.is_final() && !m.is_deleting())
        .cloned()
        .collect();
    finalized.sort_by(|a, b| {
        b.creation_timestamp()
            .cmp(&a.creation_timestamp())
            .then_with(|| a.namespace().cmp(&b.namespace()))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    finalized.into_iter().skip(keep).collect()
}

/// Delete finalized migrations beyond the buffer
///
/// Returns how many deletions were issued. A failed delete stops the sweep;
/// the remainder is picked up next time.
pub async fn sweep(kube: &dyn KubeClient, store: &ObjectStore, keep: usize) -> Result<usize, Error> {
    let doomed = finalized_to_delete(&store.all_migrations(), keep);
    if doomed.is_empty() {
        return Ok(0);
    }
    debug!(count = doomed.len(), keep, "Garbage collecting finalized migrations");
    for migration in &doomed {
        let namespace = migration.namespace().unwrap_or_default();
        let name = migration.name_any();
        kube.delete_migration(&namespace, &name).await?;
        GARBAGE_COLLECTED.add(1, &[]);
        info!(migration = %name, namespace = %namespace, "Deleted finalized migration");
    }
    Ok(doomed.len())
}
