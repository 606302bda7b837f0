//! virt-controller runtime for VirtualMachineInstanceMigration objects

#![deny(missing_docs)]

/// Watches, reflectors and background tasks around the migration reconciler
pub mod controller_runner;
/// CRD manifests owned by this controller
pub mod crds;
