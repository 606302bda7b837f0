//! VirtualMachineInstance, reduced to the fields the migration controller
//! reads or writes
//!
//! The VMI is owned by its own controller. Only `status.migrationState`,
//! `status.runtimeUser` and `metadata.labels` are ever patched from here,
//! always through JSON patches, so unknown fields are never round-tripped.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_false, EvictionStrategy, MigrationConfiguration};
use crate::labels::DEPRECATED_NON_ROOT_VMI_ANNOTATION;

/// CPU model value requesting the source host's CPU model
pub const CPU_MODE_HOST_MODEL: &str = "host-model";

/// VMI lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmiPhase {
    /// Not yet processed
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Waiting for a launcher pod
    Pending,
    /// Launcher pod created, not yet scheduled
    Scheduling,
    /// Launcher pod scheduled
    Scheduled,
    /// Guest is running
    Running,
    /// Guest shut down cleanly
    Succeeded,
    /// Guest or launcher failed
    Failed,
    /// State cannot be determined
    Unknown,
}

impl VmiPhase {
    /// Succeeded or Failed
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Requested resources for the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainResources {
    /// Resource requests (cpu, memory, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, Quantity>>,
    /// Resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, Quantity>>,
}

/// Guest CPU topology and model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    /// CPU model ("host-model", "host-passthrough" or a named model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Cores per socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Sockets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    /// Threads per core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

/// A host device passed through to the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostDeviceRef {
    /// Name of the device within the VMI
    pub name: String,
    /// Resource name the device is allocated from
    pub device_name: String,
}

/// Devices attached to the guest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// GPUs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<HostDeviceRef>,
    /// Generic PCI or mediated host devices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_devices: Vec<HostDeviceRef>,
}

/// Guest domain specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Resource requirements
    #[serde(default)]
    pub resources: DomainResources,
    /// CPU configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    /// Attached devices
    #[serde(default)]
    pub devices: Devices,
}

/// Specification for a VirtualMachineInstance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    namespaced,
    status = "VirtualMachineInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Guest domain
    #[serde(default)]
    pub domain: DomainSpec,

    /// Scheduling affinity copied onto launcher pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Node selector copied onto launcher pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Tolerations copied onto launcher pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Priority class for launcher pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Scheduler for launcher pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,

    /// Per-VMI eviction strategy; falls back to the cluster setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<EvictionStrategy>,
}

/// Status of a hotplugged volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HotplugVolumeStatus {
    /// Attachment pod currently serving the volume
    #[serde(
        default,
        rename = "attachPodName",
        skip_serializing_if = "Option::is_none"
    )]
    pub attach_pod_name: Option<String>,
    /// UID of that pod
    #[serde(default, rename = "attachPodUID", skip_serializing_if = "Option::is_none")]
    pub attach_pod_uid: Option<String>,
}

/// Per-volume status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Volume name
    #[serde(default)]
    pub name: String,
    /// Set when the volume was hotplugged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotplug_volume: Option<HotplugVolumeStatus>,
}

/// Migration progress as tracked on the VMI by the node agents
///
/// Every field is omitted when empty so that the JSON written by handoff
/// matches what the API server hands back, which test-and-set depends on.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// When the memory transfer started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,
    /// When the migration ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<Time>,
    /// Address the target agent listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_address: Option<String>,
    /// Target agent observed the incoming domain
    #[serde(default, skip_serializing_if = "is_false")]
    pub target_node_domain_detected: bool,
    /// Target node name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
    /// Target pod name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<String>,
    /// UID of the attachment pod on the target
    #[serde(
        default,
        rename = "targetAttachmentPodUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_attachment_pod_uid: Option<String>,
    /// Source node name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    /// Migration ended (successfully or not)
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    /// Migration ended in failure
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
    /// Abort was requested after handoff
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort_requested: bool,
    /// Outcome of an abort request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_status: Option<String>,
    /// UID of the migration this state belongs to
    #[serde(default, rename = "migrationUid", skip_serializing_if = "Option::is_none")]
    pub migration_uid: Option<String>,
    /// PreCopy or PostCopy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Migration policy that changed the configuration, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_policy_name: Option<String>,
    /// Configuration snapshot used for this migration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_configuration: Option<MigrationConfiguration>,
}

impl MigrationState {
    /// Whether this state was written for the migration with `uid`
    pub fn belongs_to(&self, uid: &str) -> bool {
        self.migration_uid.as_deref() == Some(uid)
    }
}

/// Status for a VirtualMachineInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Node currently running the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Lifecycle phase
    #[serde(default)]
    pub phase: VmiPhase,

    /// UID the launcher runs as (0 for legacy root launchers)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub runtime_user: u64,

    /// Migration progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<MigrationState>,

    /// Per-volume status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_status: Vec<VolumeStatus>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl VirtualMachineInstance {
    /// Status or an empty default
    pub fn status_or_default(&self) -> VirtualMachineInstanceStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current phase
    pub fn phase(&self) -> VmiPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Node running the guest
    pub fn node_name(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.node_name.as_deref())
    }

    /// Migration state recorded on the VMI
    pub fn migration_state(&self) -> Option<&MigrationState> {
        self.status.as_ref().and_then(|s| s.migration_state.as_ref())
    }

    /// Whether the VMI is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the VMI requested a host-model CPU
    pub fn is_host_model(&self) -> bool {
        self.spec
            .domain
            .cpu
            .as_ref()
            .and_then(|c| c.model.as_deref())
            == Some(CPU_MODE_HOST_MODEL)
    }

    /// Whether any volume was hotplugged
    pub fn has_hotplug_volumes(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.volume_status.iter().any(|v| v.hotplug_volume.is_some()))
    }

    /// VMI predates non-root launchers and still runs as root
    pub fn needs_non_root_upgrade(&self) -> bool {
        let annotated = self
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(DEPRECATED_NON_ROOT_VMI_ANNOTATION));
        let runtime_user = self.status.as_ref().map(|s| s.runtime_user).unwrap_or(0);
        !annotated && runtime_user == 0
    }
}
