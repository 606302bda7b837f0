//! Well-known label, annotation and finalizer keys
//!
//! These are shared with the other KubeVirt components (virt-handler,
//! virt-launcher, virt-api) and must match them byte for byte.

/// App label key present on every pod KubeVirt creates
pub const APP_LABEL: &str = "kubevirt.io";

/// [`APP_LABEL`] value for virt-launcher pods (source and target)
pub const APP_VIRT_LAUNCHER: &str = "virt-launcher";

/// [`APP_LABEL`] value for hotplug attachment pods
pub const APP_HOTPLUG_DISK: &str = "hotplug-disk";

/// UID of the VMI a pod was created for
pub const CREATED_BY_LABEL: &str = "kubevirt.io/created-by";

/// UID of the migration a target or attachment pod belongs to
pub const MIGRATION_JOB_LABEL: &str = "kubevirt.io/migrationJobUID";

/// Name of the migration a PDB has been expanded for
pub const MIGRATION_NAME_LABEL: &str = "kubevirt.io/migrationName";

/// Target node written onto the VMI at handoff
pub const MIGRATION_TARGET_NODE_NAME_LABEL: &str = "kubevirt.io/migrationTargetNodeName";

/// Node label prefix advertising the node's own host-model CPU
pub const HOST_MODEL_CPU_LABEL: &str = "host-model-cpu.node.kubevirt.io/";

/// Node label prefix advertising which host-model CPUs a node can receive
pub const SUPPORTED_HOST_MODEL_MIGRATION_CPU: &str = "cpu-model-migration.node.kubevirt.io/";

/// Node label prefix for CPU features a host-model guest depends on
pub const HOST_MODEL_REQUIRED_FEATURES_LABEL: &str =
    "host-model-required-features.node.kubevirt.io/";

/// Node selector prefix for CPU features a target node must offer
pub const CPU_FEATURE_LABEL: &str = "cpu-feature.node.kubevirt.io/";

/// Well-known hostname topology key
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Name of the migration a pod belongs to
pub const MIGRATION_JOB_NAME_ANNOTATION: &str = "kubevirt.io/migrationJobName";

/// Name of the VMI a launcher pod runs
pub const DOMAIN_ANNOTATION: &str = "kubevirt.io/domain";

/// Marks VMIs created after the non-root launcher became the default
pub const DEPRECATED_NON_ROOT_VMI_ANNOTATION: &str = "kubevirt.io/nonroot";

/// Per-migration override of the unschedulable target pod timeout, in seconds
pub const MIGRATION_UNSCHEDULABLE_POD_TIMEOUT_ANNOTATION: &str =
    "kubevirt.io/migrationUnschedulablePodTimeoutSeconds";

/// Per-migration override of the catch-all pending target pod timeout, in seconds
pub const MIGRATION_PENDING_POD_TIMEOUT_ANNOTATION: &str =
    "kubevirt.io/migrationPendingPodTimeoutSeconds";

/// Finalizer held on migrations until they reach a final phase
pub const MIGRATION_FINALIZER: &str = "kubevirt.io/migrationJobFinalizer";

/// UID the non-root launcher runs as
pub const NON_ROOT_UID: u64 = 107;
