//! Kubernetes Event recording for the migration controller.
//!
//! Events are the user-facing trail of what the reconciler did to a
//! migration or its VMI (`kubectl describe vmim`). Publishing is
//! fire-and-forget: a failed event is logged and never fails a pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (see [`reasons`])
    /// * `action` - What action was taken (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                object = ?resource_ref.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Target (or attachment) pod was created
    pub const SUCCESSFUL_CREATE_POD: &str = "SuccessfulCreatePod";
    /// Target pod creation failed or was refused
    pub const FAILED_CREATE_POD: &str = "FailedCreatePod";
    /// Target pod was deleted after a timeout or abort
    pub const SUCCESSFUL_DELETE_POD: &str = "SuccessfulDeletePod";
    /// VMI status was handed to the node agents
    pub const SUCCESSFUL_HAND_OVER_POD: &str = "SuccessfulHandOverPod";
    /// Migration ended in Failed
    pub const FAILED_MIGRATION: &str = "FailedMigration";
    /// Migration ended in Succeeded
    pub const SUCCESSFUL_MIGRATION: &str = "SuccessfulMigration";
    /// Abort was requested on a handed-off migration
    pub const SUCCESSFUL_ABORT_MIGRATION: &str = "SuccessfulAbortMigration";
    /// Target pod is not schedulable
    pub const MIGRATION_TARGET_POD_UNSCHEDULABLE: &str = "MigrationTargetPodUnschedulable";
    /// No node advertises the source node's host-model CPU
    pub const NO_SUITABLE_NODES_FOR_HOST_MODEL_MIGRATION: &str =
        "NoSuitableNodesForHostModelMigration";
    /// PDB minAvailable raised for the migration
    pub const SUCCESSFUL_UPDATE_PDB: &str = "SuccessfulUpdatePodDisruptionBudget";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a pod
    pub const CREATE: &str = "Create";
    /// Deleting a pod
    pub const DELETE: &str = "Delete";
    /// Writing migration state to the VMI
    pub const HANDOFF: &str = "Handoff";
    /// Aborting a migration
    pub const ABORT: &str = "Abort";
    /// Patching a PodDisruptionBudget
    pub const PROTECT: &str = "Protect";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_match_kubectl_output() {
        assert_eq!(reasons::SUCCESSFUL_CREATE_POD, "SuccessfulCreatePod");
        assert_eq!(reasons::SUCCESSFUL_HAND_OVER_POD, "SuccessfulHandOverPod");
        assert_eq!(
            reasons::NO_SUITABLE_NODES_FOR_HOST_MODEL_MIGRATION,
            "NoSuitableNodesForHostModelMigration"
        );
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::FAILED_MIGRATION,
                actions::RECONCILE,
                Some("target pod failed".to_string()),
            )
            .await;
    }
}
