//! Migration pods: classification, readiness and rendering
//!
//! A pod's role is read off its labels once, when it is pulled from the
//! store, and carried as a [`PodRole`] from then on.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    Pod, PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta, OwnerReference,
};
use kube::{Resource, ResourceExt};

use kubevirt_common::crd::{VirtualMachineInstance, VirtualMachineInstanceMigration};
use kubevirt_common::labels::{
    APP_HOTPLUG_DISK, APP_LABEL, APP_VIRT_LAUNCHER, CPU_FEATURE_LABEL, CREATED_BY_LABEL,
    DOMAIN_ANNOTATION, HOSTNAME_TOPOLOGY_KEY, HOST_MODEL_CPU_LABEL,
    HOST_MODEL_REQUIRED_FEATURES_LABEL, MIGRATION_JOB_LABEL, MIGRATION_JOB_NAME_ANNOTATION,
    SUPPORTED_HOST_MODEL_MIGRATION_CPU,
};
use kubevirt_common::Error;

/// Container whose state decides launcher readiness
pub const COMPUTE_CONTAINER: &str = "compute";

/// Service mesh sidecar whose readiness never blocks a migration
pub const ISTIO_PROXY_CONTAINER: &str = "istio-proxy";

const POD_SCHEDULED: &str = "PodScheduled";
const REASON_UNSCHEDULABLE: &str = "Unschedulable";

/// What a pod is to a migration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodRole {
    /// Launcher currently running the VMI
    Source,
    /// Launcher created to receive the VMI
    Target,
    /// Hotplug volume carrier next to the target launcher
    Attachment,
}

impl PodRole {
    /// Role implied by a pod's labels, None for unrelated pods
    pub fn of(pod: &Pod) -> Option<Self> {
        let labels = pod.labels();
        match labels.get(APP_LABEL).map(String::as_str) {
            Some(APP_HOTPLUG_DISK) => Some(Self::Attachment),
            Some(APP_VIRT_LAUNCHER) if labels.contains_key(MIGRATION_JOB_LABEL) => {
                Some(Self::Target)
            }
            Some(APP_VIRT_LAUNCHER) => Some(Self::Source),
            _ => None,
        }
    }
}

/// Target and attachment pods of one migration
#[derive(Clone, Debug, Default)]
pub struct MigrationPods {
    /// Target launcher pods (more than one is an error)
    pub targets: Vec<Arc<Pod>>,
    /// Attachment pods
    pub attachments: Vec<Arc<Pod>>,
}

impl MigrationPods {
    /// Sort pods by role, ignoring anything that is not a migration pod
    pub fn classify(pods: impl IntoIterator<Item = Arc<Pod>>) -> Self {
        let mut out = Self::default();
        for pod in pods {
            match PodRole::of(&pod) {
                Some(PodRole::Target) => out.targets.push(pod),
                Some(PodRole::Attachment) => out.attachments.push(pod),
                _ => {}
            }
        }
        out
    }

    /// The single target pod, if any
    pub fn target(&self) -> Result<Option<&Arc<Pod>>, Error> {
        match self.targets.as_slice() {
            [] => Ok(None),
            [pod] => Ok(Some(pod)),
            pods => Err(Error::internal_with_context(
                "pods",
                format!("found {} target pods where only one should exist", pods.len()),
            )),
        }
    }

    /// The attachment pod, preferring one that is still alive
    pub fn attachment(&self) -> Option<&Arc<Pod>> {
        self.attachments
            .iter()
            .find(|p| !is_final(p))
            .or_else(|| self.attachments.first())
    }
}

// =============================================================================
// Status
// =============================================================================

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Pod phase is Pending
pub fn is_pending(pod: &Pod) -> bool {
    phase(pod) == Some("Pending")
}

/// Pod phase is Running
pub fn is_running(pod: &Pod) -> bool {
    phase(pod) == Some("Running")
}

/// Pod phase is Succeeded or Failed
pub fn is_final(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
}

/// Target launcher can receive the VMI
///
/// Requires the pod to be Running with a running compute container.
pub fn is_launcher_ready(pod: &Pod) -> bool {
    if phase(pod) != Some("Running") {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|c| {
                c.name == COMPUTE_CONTAINER
                    && c.state.as_ref().is_some_and(|st| st.running.is_some())
            })
        })
}

/// Every container except the mesh sidecar is running
pub fn is_attachment_ready(pod: &Pod) -> bool {
    if phase(pod) != Some("Running") {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses
                .iter()
                .filter(|c| c.name != ISTIO_PROXY_CONTAINER)
                .all(|c| c.state.as_ref().is_some_and(|st| st.running.is_some()))
        })
}

/// The scheduler reported the pod as unschedulable
pub fn is_unschedulable(pod: &Pod) -> bool {
    is_pending(pod)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| {
                conds.iter().any(|c| {
                    c.type_ == POD_SCHEDULED
                        && c.status == "False"
                        && c.reason.as_deref() == Some(REASON_UNSCHEDULABLE)
                })
            })
}

/// Creation time of a pod
pub fn created_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Node the pod was scheduled to
pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

// =============================================================================
// Host-model CPUs
// =============================================================================

/// Node selector pinning a host-model guest to compatible nodes
///
/// Every host-model CPU advertised by the source node becomes a
/// migration-support requirement, and each required CPU feature becomes a
/// feature requirement. Fails when the source node advertises no model.
pub fn host_model_node_selector(
    source_node_name: &str,
    source_labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Error> {
    let mut selector = BTreeMap::new();
    let mut found_model = false;
    for (key, value) in source_labels {
        if let Some(model) = key.strip_prefix(HOST_MODEL_CPU_LABEL) {
            selector.insert(format!("{SUPPORTED_HOST_MODEL_MIGRATION_CPU}{model}"), value.clone());
            found_model = true;
        } else if let Some(feature) = key.strip_prefix(HOST_MODEL_REQUIRED_FEATURES_LABEL) {
            selector.insert(format!("{CPU_FEATURE_LABEL}{feature}"), value.clone());
        }
    }
    if !found_model {
        return Err(Error::internal_with_context(
            "host-model",
            format!("node {source_node_name} does not advertise a host-model CPU"),
        ));
    }
    Ok(selector)
}

/// Whether any node satisfies the pod's host-model requirements
pub fn host_model_schedulable<'a>(
    pod: &Pod,
    node_labels: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> bool {
    let required: Vec<(&String, &String)> = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_selector.as_ref())
        .map(|sel| {
            sel.iter()
                .filter(|(k, _)| k.starts_with(SUPPORTED_HOST_MODEL_MIGRATION_CPU))
                .collect()
        })
        .unwrap_or_default();
    if required.is_empty() {
        return true;
    }
    node_labels
        .into_iter()
        .any(|labels| required.iter().all(|(k, v)| labels.get(*k) == Some(*v)))
}

// =============================================================================
// Rendering
// =============================================================================

fn missing(what: &str) -> Error {
    Error::internal_with_context("render", format!("{what} has no uid"))
}

fn owner_reference<K: Resource<DynamicType = ()>>(obj: &K, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: obj.meta().name.clone().unwrap_or_default(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn hostname_term(node: &str) -> NodeSelectorTerm {
    NodeSelectorTerm {
        match_expressions: Some(vec![NodeSelectorRequirement {
            key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            operator: "In".to_string(),
            values: Some(vec![node.to_string()]),
        }]),
        ..Default::default()
    }
}

/// Keep the target away from any node already running this VMI
fn with_anti_affinity(affinity: Option<Affinity>, vmi_uid: &str) -> Affinity {
    let mut affinity = affinity.unwrap_or_default();
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: CREATED_BY_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![vmi_uid.to_string()]),
            }]),
            ..Default::default()
        }),
        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        ..Default::default()
    };
    affinity
        .pod_anti_affinity
        .get_or_insert_with(PodAntiAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(term);
    affinity
}

/// Inputs for a target launcher pod
pub struct TargetPodParams<'a> {
    /// Migration the pod serves
    pub migration: &'a VirtualMachineInstanceMigration,
    /// VMI being migrated
    pub vmi: &'a VirtualMachineInstance,
    /// Compute container from the resource renderer
    pub compute: Container,
    /// Extra node selector for host-model guests
    pub host_model_selector: Option<BTreeMap<String, String>>,
}

/// Render the target launcher pod
pub fn render_target_pod(params: TargetPodParams<'_>) -> Result<Pod, Error> {
    let TargetPodParams {
        migration,
        vmi,
        compute,
        host_model_selector,
    } = params;
    let vmi_uid = vmi.uid().ok_or_else(|| missing("VirtualMachineInstance"))?;
    let migration_uid = migration.uid().ok_or_else(|| missing("VirtualMachineInstanceMigration"))?;
    let vmi_name = vmi.name_any();

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_VIRT_LAUNCHER.to_string()),
        (CREATED_BY_LABEL.to_string(), vmi_uid.clone()),
        (MIGRATION_JOB_LABEL.to_string(), migration_uid),
    ]);
    let annotations = BTreeMap::from([
        (DOMAIN_ANNOTATION.to_string(), vmi_name.clone()),
        (MIGRATION_JOB_NAME_ANNOTATION.to_string(), migration.name_any()),
    ]);

    let mut node_selector = vmi.spec.node_selector.clone().unwrap_or_default();
    node_selector.extend(host_model_selector.unwrap_or_default());

    let runtime_user = vmi.status.as_ref().map(|s| s.runtime_user).unwrap_or(0);
    let security_context = PodSecurityContext {
        run_as_user: Some(runtime_user as i64),
        run_as_non_root: Some(runtime_user != 0),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("virt-launcher-{vmi_name}-")),
            namespace: vmi.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(vmi, &vmi_uid)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![compute],
            affinity: Some(with_anti_affinity(vmi.spec.affinity.clone(), &vmi_uid)),
            node_selector: (!node_selector.is_empty()).then_some(node_selector),
            tolerations: vmi.spec.tolerations.clone(),
            priority_class_name: vmi.spec.priority_class_name.clone(),
            scheduler_name: vmi.spec.scheduler_name.clone(),
            security_context: Some(security_context),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Render the attachment pod next to a scheduled target pod
pub fn render_attachment_pod(
    migration: &VirtualMachineInstanceMigration,
    vmi: &VirtualMachineInstance,
    target: &Pod,
    container: Container,
) -> Result<Pod, Error> {
    let migration_uid = migration.uid().ok_or_else(|| missing("VirtualMachineInstanceMigration"))?;
    let target_uid = target.uid().ok_or_else(|| missing("target pod"))?;
    let node = node_name(target).ok_or_else(|| {
        Error::internal_with_context("render", "target pod is not scheduled yet")
    })?;

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_HOTPLUG_DISK.to_string()),
        (MIGRATION_JOB_LABEL.to_string(), migration_uid),
    ]);
    let annotations = BTreeMap::from([(
        MIGRATION_JOB_NAME_ANNOTATION.to_string(),
        migration.name_any(),
    )]);

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("hp-volume-{}-", vmi.name_any())),
            namespace: vmi.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(target, &target_uid)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            affinity: Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                        node_selector_terms: vec![hostname_term(node)],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            tolerations: vmi.spec.tolerations.clone(),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    /// Target pod for a migration in the given phase
    pub(crate) fn target_pod(
        name: &str,
        vmi_uid: &str,
        migration_uid: &str,
        phase: &str,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{name}-uid")),
                creation_timestamp: Some(Time(Utc::now())),
                labels: Some(BTreeMap::from([
                    (APP_LABEL.to_string(), APP_VIRT_LAUNCHER.to_string()),
                    (CREATED_BY_LABEL.to_string(), vmi_uid.to_string()),
                    (MIGRATION_JOB_LABEL.to_string(), migration_uid.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    /// Mark the pod's compute container as running
    pub(crate) fn with_running_compute(mut pod: Pod) -> Pod {
        let status = pod.status.get_or_insert_with(PodStatus::default);
        status.container_statuses = Some(vec![ContainerStatus {
            name: COMPUTE_CONTAINER.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    /// Mark the pod unschedulable
    pub(crate) fn with_unschedulable(mut pod: Pod) -> Pod {
        let status = pod.status.get_or_insert_with(PodStatus::default);
        status.conditions = Some(vec![PodCondition {
            type_: POD_SCHEDULED.to_string(),
            status: "False".to_string(),
            reason: Some(REASON_UNSCHEDULABLE.to_string()),
            ..Default::default()
        }]);
        pod
    }

    /// Place the pod on a node
    pub(crate) fn on_node(mut pod: Pod, node: &str) -> Pod {
        pod.spec.get_or_insert_with(PodSpec::default).node_name = Some(node.to_string());
        pod
    }
}
