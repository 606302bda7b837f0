//! Custom Resource Definitions used by the migration controller

mod kubevirt;
mod migration;
mod policy;
mod types;
mod vmi;

pub use kubevirt::{
    DeveloperConfiguration, KubeVirt, KubeVirtConfiguration, KubeVirtSpec, LogVerbosity,
    MediatedHostDevice, PciHostDevice, PermittedHostDevices,
};
pub use migration::{
    MigrationPhase, PhaseTransitionTimestamp, VirtualMachineInstanceMigration,
    VirtualMachineInstanceMigrationSpec, VirtualMachineInstanceMigrationStatus,
    CONDITION_ABORT_REQUESTED,
};
pub use policy::{MigrationPolicy, MigrationPolicySpec, Selectors};
pub use types::{Condition, ConditionStatus, EvictionStrategy, MigrationConfiguration};
pub use vmi::{
    CpuSpec, Devices, DomainResources, DomainSpec, HostDeviceRef, HotplugVolumeStatus,
    MigrationState, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VmiPhase, VolumeStatus, CPU_MODE_HOST_MODEL,
};
