//! Pod disruption budget expansion for protected VMIs
//!
//! A VMI with LiveMigrate eviction is guarded by a PDB with minAvailable 1.
//! While a migration runs there are two launcher pods, so the budget is
//! raised to 2 and labeled with the migration name before the target pod is
//! created. Creation then waits until the disruption controller has observed
//! the new generation.

use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde_json::{json, Value};

use kubevirt_common::crd::EvictionStrategy;
use kubevirt_common::labels::MIGRATION_NAME_LABEL;

/// minAvailable while a migration is in flight
pub const MIGRATION_MIN_AVAILABLE: i32 = 2;

/// What the reconciler must do about PDBs before creating a target pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PdbState {
    /// The VMI is not protected; go ahead
    NotRequired,
    /// The named PDB still needs the migration patch
    NeedsPatch(String),
    /// Patched but not yet observed by the disruption controller
    Waiting,
    /// Every PDB reflects the migration
    Ready,
}

/// Whether migrations of this VMI expand its PDB
///
/// The VMI's own strategy wins over the cluster-wide one.
pub fn protects(vmi_strategy: Option<EvictionStrategy>, cluster_strategy: Option<EvictionStrategy>) -> bool {
    vmi_strategy.or(cluster_strategy) == Some(EvictionStrategy::LiveMigrate)
}

fn is_expanded_for(pdb: &PodDisruptionBudget, migration_name: &str) -> bool {
    let labeled = pdb.labels().get(MIGRATION_NAME_LABEL).map(String::as_str) == Some(migration_name);
    let expanded = pdb.spec.as_ref().and_then(|s| s.min_available.as_ref())
        == Some(&IntOrString::Int(MIGRATION_MIN_AVAILABLE));
    labeled && expanded
}

fn is_observed(pdb: &PodDisruptionBudget) -> bool {
    let generation = pdb.metadata.generation;
    let observed = pdb.status.as_ref().and_then(|s| s.observed_generation);
    generation.is_some() && observed == generation
}

/// Evaluate the VMI's PDBs for `migration_name`
pub fn evaluate<'a>(
    pdbs: impl IntoIterator<Item = &'a PodDisruptionBudget>,
    migration_name: &str,
) -> PdbState {
    let mut state = PdbState::NotRequired;
    for pdb in pdbs {
        if !is_expanded_for(pdb, migration_name) {
            return PdbState::NeedsPatch(pdb.name_any());
        }
        if !is_observed(pdb) {
            state = PdbState::Waiting;
        } else if state == PdbState::NotRequired {
            state = PdbState::Ready;
        }
    }
    state
}

/// Strategic merge patch expanding a PDB for a migration
pub fn expansion_patch(migration_name: &str) -> Value {
    json!({
        "spec": {"minAvailable": MIGRATION_MIN_AVAILABLE},
        "metadata": {"labels": {MIGRATION_NAME_LABEL: migration_name}},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn pdb(min_available: i32, label: Option<&str>, generation: i64, observed: i64) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some("pdb-test".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(generation),
                labels: label.map(|l| BTreeMap::from([(MIGRATION_NAME_LABEL.to_string(), l.to_string())])),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::Int(min_available)),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                observed_generation: Some(observed),
                ..Default::default()
            }),
        }
    }

    #[rstest]
    #[case(Some(EvictionStrategy::LiveMigrate), None, true)]
    #[case(None, Some(EvictionStrategy::LiveMigrate), true)]
    #[case(Some(EvictionStrategy::None), Some(EvictionStrategy::LiveMigrate), false)]
    #[case(Some(EvictionStrategy::External), None, false)]
    #[case(None, None, false)]
    fn vmi_strategy_overrides_cluster(
        #[case] vmi: Option<EvictionStrategy>,
        #[case] cluster: Option<EvictionStrategy>,
        #[case] expected: bool,
    ) {
        assert_eq!(protects(vmi, cluster), expected);
    }

    /// Story: the budget is expanded first, then observed, then the pod goes
    #[test]
    fn story_pdb_expansion_sequence() {
        let original = pdb(1, None, 1, 1);
        assert_eq!(
            evaluate([&original], "testmigration"),
            PdbState::NeedsPatch("pdb-test".to_string())
        );

        let patched = pdb(2, Some("testmigration"), 42, 1);
        assert_eq!(evaluate([&patched], "testmigration"), PdbState::Waiting);

        let observed = pdb(2, Some("testmigration"), 42, 42);
        assert_eq!(evaluate([&observed], "testmigration"), PdbState::Ready);
    }

    #[test]
    fn budget_left_by_an_earlier_migration_is_patched_again() {
        let stale = pdb(2, Some("previous"), 3, 3);
        assert_eq!(
            evaluate([&stale], "testmigration"),
            PdbState::NeedsPatch("pdb-test".to_string())
        );
    }

    #[test]
    fn unprotected_vmi_needs_nothing() {
        assert_eq!(evaluate(std::iter::empty(), "m"), PdbState::NotRequired);
    }

    #[test]
    fn expansion_patch_shape() {
        assert_eq!(
            expansion_patch("testmigration"),
            serde_json::json!({
                "spec": {"minAvailable": 2},
                "metadata": {"labels": {"kubevirt.io/migrationName": "testmigration"}}
            })
        );
    }
}
