//! Common types for the KubeVirt migration controller: CRDs, configuration,
//! errors, events and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod labels;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Controller name used as event reporter and field manager
pub const CONTROLLER_NAME: &str = "virtualmachineinstancemigration-controller";

/// Default namespace KubeVirt is installed into
pub const DEFAULT_KUBEVIRT_NAMESPACE: &str = "kubevirt";
