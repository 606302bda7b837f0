//! Admission gate for new target pods
//!
//! Counts are recomputed from the object store on every Pending pass. There
//! is no counter state to drift; a stale cache can only over- or under-count
//! briefly, and the next pass corrects it.

use kube::ResourceExt;

use kubevirt_common::crd::{MigrationPhase, VirtualMachineInstanceMigration};
use kubevirt_common::metrics::AdmissionLimit;

use crate::pod::{self, MigrationPods};
use crate::store::ObjectStore;

/// Outcome of an admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A target pod may be created
    Admitted,
    /// A limit is reached; stay Pending and retry later
    Deferred(AdmissionLimit),
}

/// Limits applied by [`admit`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Maximum in-flight migrations in the cluster
    pub per_cluster: u32,
    /// Maximum in-flight migrations leaving one node
    pub per_node: u32,
}

/// Whether a migration counts against the limits
///
/// Every active phase counts. A Pending migration counts once it owns a
/// target pod that has not terminated.
pub fn is_in_flight(store: &ObjectStore, migration: &VirtualMachineInstanceMigration) -> bool {
    match migration.phase() {
        MigrationPhase::Scheduling
        | MigrationPhase::Scheduled
        | MigrationPhase::PreparingTarget
        | MigrationPhase::TargetReady
        | MigrationPhase::Running => true,
        MigrationPhase::Pending => {
            let (Some(namespace), Some(uid)) = (migration.namespace(), migration.uid()) else {
                return false;
            };
            MigrationPods::classify(store.pods_for_migration(&namespace, &uid))
                .targets
                .iter()
                .any(|p| !pod::is_final(p))
        }
        _ => false,
    }
}

/// Decide whether `candidate` may create its target pod now
///
/// `source_node` is the node the candidate's VMI runs on. Migrations whose
/// VMI is gone do not count against the per-node limit. The candidate itself
/// is never counted.
pub fn admit(
    store: &ObjectStore,
    candidate: &VirtualMachineInstanceMigration,
    source_node: Option<&str>,
    limits: Limits,
) -> Admission {
    let candidate_uid = candidate.uid();
    let in_flight: Vec<_> = store
        .all_migrations()
        .into_iter()
        .filter(|m| m.uid() != candidate_uid)
        .filter(|m| is_in_flight(store, m))
        .collect();

    if in_flight.len() >= limits.per_cluster as usize {
        return Admission::Deferred(AdmissionLimit::Cluster);
    }

    let outbound = in_flight
        .iter()
        .filter_map(|m| store.vmi_for(m))
        .filter(|vmi| vmi.node_name() == source_node)
        .count();
    if outbound >= limits.per_node as usize {
        return Admission::Deferred(AdmissionLimit::Node);
    }

    Admission::Admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::testing::target_pod;
    use crate::store::testing::StoreFixture;
    use kubevirt_common::crd::{
        VirtualMachineInstance, VirtualMachineInstanceMigrationSpec,
        VirtualMachineInstanceMigrationStatus, VirtualMachineInstanceSpec,
        VirtualMachineInstanceStatus,
    };
    use rstest::rstest;

    const LIMITS: Limits = Limits {
        per_cluster: 5,
        per_node: 2,
    };

    fn migration(name: &str, vmi: &str, phase: MigrationPhase) -> VirtualMachineInstanceMigration {
        let mut m = VirtualMachineInstanceMigration::new(
            name,
            VirtualMachineInstanceMigrationSpec {
                vmi_name: vmi.to_string(),
            },
        );
        m.metadata.namespace = Some("default".to_string());
        m.metadata.uid = Some(format!("{name}-uid"));
        m.status = Some(VirtualMachineInstanceMigrationStatus {
            phase,
            ..Default::default()
        });
        m
    }

    fn vmi(name: &str, node: &str) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new(name, VirtualMachineInstanceSpec::default());
        vmi.metadata.namespace = Some("default".to_string());
        vmi.metadata.uid = Some(format!("{name}-uid"));
        vmi.status = Some(VirtualMachineInstanceStatus {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        vmi
    }

    /// Fill a fixture with `count` in-flight migrations on `node`
    fn with_in_flight(mut fixture: StoreFixture, prefix: &str, count: usize, node: &str) -> StoreFixture {
        for i in 0..count {
            let vmi_name = format!("{prefix}-vmi-{i}");
            fixture = fixture
                .vmi(vmi(&vmi_name, node))
                .migration(migration(&format!("{prefix}-{i}"), &vmi_name, MigrationPhase::Scheduling));
        }
        fixture
    }

    mod cluster_limit {
        use super::*;

        /// Story: the cluster limit holds the line at exactly five
        ///
        /// Five in-flight migrations spread across nodes block a new one;
        /// four leave room for it.
        #[rstest]
        #[case(5, Admission::Deferred(AdmissionLimit::Cluster))]
        #[case(4, Admission::Admitted)]
        fn story_cluster_limit_boundary(#[case] running: usize, #[case] expected: Admission) {
            let mut fixture = StoreFixture::new();
            for i in 0..running {
                fixture = with_in_flight(fixture, &format!("n{i}"), 1, &format!("node{i}"));
            }
            let candidate = migration("candidate", "candidate-vmi", MigrationPhase::Pending);
            let fixture = fixture
                .vmi(vmi("candidate-vmi", "fresh-node"))
                .migration(candidate.clone());

            assert_eq!(
                admit(&fixture.store, &candidate, Some("fresh-node"), LIMITS),
                expected
            );
        }

        #[test]
        fn final_and_idle_pending_migrations_do_not_count() {
            let mut fixture = StoreFixture::new();
            for i in 0..5 {
                fixture = fixture
                    .migration(migration(&format!("done-{i}"), "x", MigrationPhase::Succeeded))
                    .migration(migration(&format!("failed-{i}"), "x", MigrationPhase::Failed))
                    .migration(migration(&format!("queued-{i}"), "x", MigrationPhase::Pending));
            }
            let candidate = migration("candidate", "candidate-vmi", MigrationPhase::Pending);
            assert_eq!(
                admit(&fixture.store, &candidate, Some("node01"), LIMITS),
                Admission::Admitted
            );
        }

        #[test]
        fn pending_with_live_target_pod_counts() {
            let mut fixture = StoreFixture::new();
            for i in 0..5 {
                let m = migration(&format!("p-{i}"), "x", MigrationPhase::Pending);
                let uid = m.uid().unwrap();
                fixture = fixture
                    .pod(target_pod(&format!("pod-{i}"), "x-uid", &uid, "Pending"))
                    .migration(m);
            }
            let candidate = migration("candidate", "candidate-vmi", MigrationPhase::Pending);
            assert_eq!(
                admit(&fixture.store, &candidate, Some("node01"), LIMITS),
                Admission::Deferred(AdmissionLimit::Cluster)
            );
        }

        #[test]
        fn pending_with_terminated_target_pod_does_not_count() {
            let m = migration("p", "x", MigrationPhase::Pending);
            let uid = m.uid().unwrap();
            let fixture = StoreFixture::new()
                .pod(target_pod("pod", "x-uid", &uid, "Failed"))
                .migration(m.clone());
            assert!(!is_in_flight(&fixture.store, &m));
        }
    }

    mod node_limit {
        use super::*;

        /// Story: two outbound migrations saturate a node
        ///
        /// A third migration leaving node01 waits; one leaving node02 goes.
        #[test]
        fn story_node_limit_only_blocks_same_source_node() {
            let fixture = with_in_flight(StoreFixture::new(), "busy", 2, "node01")
                .vmi(vmi("same-vmi", "node01"))
                .vmi(vmi("other-vmi", "node02"));
            let same = migration("same", "same-vmi", MigrationPhase::Pending);
            let other = migration("other", "other-vmi", MigrationPhase::Pending);

            assert_eq!(
                admit(&fixture.store, &same, Some("node01"), LIMITS),
                Admission::Deferred(AdmissionLimit::Node)
            );
            assert_eq!(
                admit(&fixture.store, &other, Some("node02"), LIMITS),
                Admission::Admitted
            );
        }

        #[test]
        fn one_outbound_migration_leaves_room() {
            let fixture = with_in_flight(StoreFixture::new(), "busy", 1, "node01");
            let candidate = migration("c", "c-vmi", MigrationPhase::Pending);
            assert_eq!(
                admit(&fixture.store, &candidate, Some("node01"), LIMITS),
                Admission::Admitted
            );
        }

        #[test]
        fn candidate_is_not_counted_against_itself() {
            let fixture = with_in_flight(StoreFixture::new(), "busy", 1, "node01");
            let mut candidate = migration("c", "c-vmi", MigrationPhase::Scheduling);
            candidate.metadata.uid = Some("busy-0-uid".to_string());
            assert_eq!(
                admit(&fixture.store, &candidate, Some("node01"), LIMITS),
                Admission::Admitted
            );
        }
    }
}
