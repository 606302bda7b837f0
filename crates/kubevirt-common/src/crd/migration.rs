//! VirtualMachineInstanceMigration Custom Resource Definition
//!
//! A migration asks the controller to move one running VMI to another node.
//! Deleting a migration before it completes is how users request an abort.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::vmi::MigrationState;

/// Condition type set when a user deletes an unfinished migration
pub const CONDITION_ABORT_REQUESTED: &str = "AbortRequested";

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of a migration
///
/// Variants are declared in lifecycle order; `Ord` follows that order and
/// is what the regression guard compares.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum MigrationPhase {
    /// Not yet observed by the controller
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Waiting for admission and target pod creation
    Pending,
    /// Target pod created, waiting for it to be scheduled and ready
    Scheduling,
    /// Target pod ready, waiting for handoff
    Scheduled,
    /// Handed off, waiting for the target node to prepare
    PreparingTarget,
    /// Target node is listening for the migration stream
    TargetReady,
    /// Memory transfer in progress
    Running,
    /// Migration completed successfully
    Succeeded,
    /// Migration failed or was aborted
    Failed,
}

impl MigrationPhase {
    /// Succeeded or Failed
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    ///
    /// Final phases never change. Any non-final phase may short-circuit to
    /// Failed; otherwise the phase may only move forward.
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        if self.is_final() {
            return *self == next;
        }
        next == Self::Failed || next >= *self
    }

    /// Phase name as written on the wire ("" for Unset)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Pending => "Pending",
            Self::Scheduling => "Scheduling",
            Self::Scheduled => "Scheduled",
            Self::PreparingTarget => "PreparingTarget",
            Self::TargetReady => "TargetReady",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Spec / Status
// =============================================================================

/// Specification for a VirtualMachineInstanceMigration
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstanceMigration",
    plural = "virtualmachineinstancemigrations",
    shortname = "vmim",
    namespaced,
    status = "VirtualMachineInstanceMigrationStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"VMI","type":"string","jsonPath":".spec.vmiName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationSpec {
    /// Name of the VMI to migrate, in the migration's namespace
    pub vmi_name: String,
}

/// Time a migration entered a phase
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransitionTimestamp {
    /// Phase entered
    pub phase: MigrationPhase,
    /// When it was entered
    pub phase_transition_timestamp: Time,
}

/// Status for a VirtualMachineInstanceMigration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceMigrationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Conditions (AbortRequested, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// History of phase changes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phase_transition_timestamps: Vec<PhaseTransitionTimestamp>,

    /// Copy of the VMI migration state while it belongs to this migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,
}

impl VirtualMachineInstanceMigrationStatus {
    /// Whether a condition of the given type is present
    pub fn has_condition(&self, type_: &str) -> bool {
        self.conditions.iter().any(|c| c.type_ == type_)
    }

    /// Add or replace a condition by type
    pub fn set_condition(&mut self, condition: Condition) {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
    }

    /// Move to `phase`, recording a transition timestamp when it changes
    ///
    /// Returns false, leaving the status untouched, when the move would
    /// regress the lifecycle.
    pub fn transition_to(&mut self, phase: MigrationPhase, at: Time) -> bool {
        if self.phase == phase {
            return true;
        }
        if !self.phase.can_transition_to(phase) {
            return false;
        }
        self.phase = phase;
        self.phase_transition_timestamps
            .push(PhaseTransitionTimestamp {
                phase,
                phase_transition_timestamp: at,
            });
        true
    }
}

impl VirtualMachineInstanceMigration {
    /// Current phase, Unset when status is absent
    pub fn phase(&self) -> MigrationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the migration reached Succeeded or Failed
    pub fn is_final(&self) -> bool {
        self.phase().is_final()
    }

    /// Whether deletion (abort) has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn now() -> Time {
        Time(Utc::now())
    }

    mod phase {
        use super::*;
        use rstest::rstest;

        #[rstest]
        #[case(MigrationPhase::Unset, MigrationPhase::Pending, true)]
        #[case(MigrationPhase::Pending, MigrationPhase::Scheduling, true)]
        #[case(MigrationPhase::Scheduled, MigrationPhase::Running, true)]
        #[case(MigrationPhase::Running, MigrationPhase::Scheduling, false)]
        #[case(MigrationPhase::Pending, MigrationPhase::Failed, true)]
        #[case(MigrationPhase::Running, MigrationPhase::Succeeded, true)]
        #[case(MigrationPhase::Succeeded, MigrationPhase::Failed, false)]
        #[case(MigrationPhase::Failed, MigrationPhase::Pending, false)]
        #[case(MigrationPhase::Failed, MigrationPhase::Failed, true)]
        fn transitions_are_monotonic(
            #[case] from: MigrationPhase,
            #[case] to: MigrationPhase,
            #[case] allowed: bool,
        ) {
            assert_eq!(from.can_transition_to(to), allowed);
        }

        #[test]
        fn unset_phase_serializes_as_empty_string() {
            assert_eq!(serde_json::to_string(&MigrationPhase::Unset).unwrap(), r#""""#);
            assert_eq!(
                serde_json::from_str::<MigrationPhase>(r#""PreparingTarget""#).unwrap(),
                MigrationPhase::PreparingTarget
            );
            assert_eq!(MigrationPhase::TargetReady.to_string(), "TargetReady");
        }
    }

    mod status {
        use super::*;
        use crate::crd::types::ConditionStatus;

        #[test]
        fn transition_records_timestamps_once_per_change() {
            let mut status = VirtualMachineInstanceMigrationStatus::default();
            assert!(status.transition_to(MigrationPhase::Pending, now()));
            assert!(status.transition_to(MigrationPhase::Pending, now()));
            assert!(status.transition_to(MigrationPhase::Scheduling, now()));
            assert_eq!(status.phase_transition_timestamps.len(), 2);
        }

        #[test]
        fn regression_is_refused() {
            let mut status = VirtualMachineInstanceMigrationStatus {
                phase: MigrationPhase::Running,
                ..Default::default()
            };
            assert!(!status.transition_to(MigrationPhase::Pending, now()));
            assert_eq!(status.phase, MigrationPhase::Running);
            assert!(status.phase_transition_timestamps.is_empty());
        }

        #[test]
        fn set_condition_replaces_by_type() {
            let mut status = VirtualMachineInstanceMigrationStatus::default();
            status.set_condition(Condition::new(
                CONDITION_ABORT_REQUESTED,
                ConditionStatus::False,
                "",
                "",
            ));
            status.set_condition(Condition::new(
                CONDITION_ABORT_REQUESTED,
                ConditionStatus::True,
                "",
                "",
            ));
            assert_eq!(status.conditions.len(), 1);
            assert_eq!(status.conditions[0].status, ConditionStatus::True);
            assert!(status.has_condition(CONDITION_ABORT_REQUESTED));
        }
    }
}
