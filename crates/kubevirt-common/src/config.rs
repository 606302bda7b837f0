//! Cluster-wide configuration provider
//!
//! Wraps the `spec.configuration` of the KubeVirt install object. The
//! controller runner replaces the snapshot whenever the object changes;
//! everything else only reads. Unset values resolve to the defaults below.

use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::crd::{
    Devices, EvictionStrategy, KubeVirtConfiguration, LogVerbosity, MigrationConfiguration,
    PermittedHostDevices,
};
use crate::Error;

/// Default ParallelMigrationsPerCluster
pub const PARALLEL_MIGRATIONS_PER_CLUSTER_DEFAULT: u32 = 5;
/// Default ParallelOutboundMigrationsPerNode
pub const PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE_DEFAULT: u32 = 2;
/// Default bandwidth cap ("0Mi" = unlimited)
pub const BANDWIDTH_PER_MIGRATION_DEFAULT: &str = "0Mi";
/// Default completionTimeoutPerGiB
pub const MIGRATION_COMPLETION_TIMEOUT_PER_GIB: i64 = 800;
/// Default progressTimeout
pub const MIGRATION_PROGRESS_TIMEOUT: i64 = 150;
/// Default node drain taint
pub const NODE_DRAIN_TAINT_KEY_DEFAULT: &str = "kubevirt.io/drain";
/// Verbosity used when a component has none configured
pub const DEFAULT_LOG_VERBOSITY: u32 = 2;

/// The built-in migration configuration
pub fn default_migration_configuration() -> MigrationConfiguration {
    MigrationConfiguration {
        parallel_migrations_per_cluster: Some(PARALLEL_MIGRATIONS_PER_CLUSTER_DEFAULT),
        parallel_outbound_migrations_per_node: Some(PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE_DEFAULT),
        bandwidth_per_migration: Some(Quantity(BANDWIDTH_PER_MIGRATION_DEFAULT.to_string())),
        completion_timeout_per_gib: Some(MIGRATION_COMPLETION_TIMEOUT_PER_GIB),
        progress_timeout: Some(MIGRATION_PROGRESS_TIMEOUT),
        unsafe_migration_override: Some(false),
        allow_auto_converge: Some(false),
        allow_post_copy: Some(false),
        disable_tls: None,
        network: None,
        node_drain_taint_key: Some(NODE_DRAIN_TAINT_KEY_DEFAULT.to_string()),
    }
}

// =============================================================================
// Components
// =============================================================================

/// KubeVirt components with an individually configurable log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtComponent {
    /// virt-handler (node agent)
    VirtHandler,
    /// virt-api
    VirtApi,
    /// virt-controller
    VirtController,
    /// virt-operator
    VirtOperator,
    /// virt-launcher (per-VMI)
    VirtLauncher,
}

impl VirtComponent {
    /// Component name as used in deployments and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtHandler => "virt-handler",
            Self::VirtApi => "virt-api",
            Self::VirtController => "virt-controller",
            Self::VirtOperator => "virt-operator",
            Self::VirtLauncher => "virt-launcher",
        }
    }

    /// Whether per-node verbosity overrides apply
    ///
    /// virt-launcher has no node at configuration time.
    pub fn is_node_bound(&self) -> bool {
        !matches!(self, Self::VirtLauncher)
    }

    fn configured(&self, conf: &LogVerbosity) -> Option<u32> {
        match self {
            Self::VirtHandler => conf.virt_handler,
            Self::VirtApi => conf.virt_api,
            Self::VirtController => conf.virt_controller,
            Self::VirtOperator => conf.virt_operator,
            Self::VirtLauncher => conf.virt_launcher,
        }
    }
}

impl FromStr for VirtComponent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virt-handler" => Ok(Self::VirtHandler),
            "virt-api" => Ok(Self::VirtApi),
            "virt-controller" => Ok(Self::VirtController),
            "virt-operator" => Ok(Self::VirtOperator),
            "virt-launcher" => Ok(Self::VirtLauncher),
            other => Err(Error::validation(format!(
                "unknown virt component: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for VirtComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ClusterConfig
// =============================================================================

/// Read-mostly view of the cluster configuration
#[derive(Debug, Default)]
pub struct ClusterConfig {
    current: RwLock<KubeVirtConfiguration>,
}

impl ClusterConfig {
    /// Create a provider from an initial configuration
    pub fn new(config: KubeVirtConfiguration) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    /// Replace the configuration snapshot
    pub fn update(&self, config: KubeVirtConfiguration) {
        let mut current = self.current.write();
        if *current != config {
            debug!("cluster configuration changed");
            *current = config;
        }
    }

    /// Migration configuration with defaults filled in
    pub fn migration_configuration(&self) -> MigrationConfiguration {
        let defaults = default_migration_configuration();
        self.current
            .read()
            .migration_configuration
            .clone()
            .map(|c| c.merged_over(&defaults))
            .unwrap_or(defaults)
    }

    /// ParallelMigrationsPerCluster
    pub fn parallel_migrations_per_cluster(&self) -> u32 {
        self.migration_configuration()
            .parallel_migrations_per_cluster
            .unwrap_or(PARALLEL_MIGRATIONS_PER_CLUSTER_DEFAULT)
    }

    /// ParallelOutboundMigrationsPerNode
    pub fn parallel_outbound_migrations_per_node(&self) -> u32 {
        self.migration_configuration()
            .parallel_outbound_migrations_per_node
            .unwrap_or(PARALLEL_OUTBOUND_MIGRATIONS_PER_NODE_DEFAULT)
    }

    /// Cluster default eviction strategy
    pub fn eviction_strategy(&self) -> Option<EvictionStrategy> {
        self.current.read().eviction_strategy
    }

    /// Host device allow-list, None when unrestricted
    pub fn permitted_host_devices(&self) -> Option<PermittedHostDevices> {
        self.current.read().permitted_host_devices.clone()
    }

    /// Check the devices a VMI requests against the allow-list
    ///
    /// Unrestricted when no allow-list is configured. Every violation is
    /// reported in one validation error.
    pub fn validate_host_devices(&self, vmi: &str, devices: &Devices) -> Result<(), Error> {
        let Some(permitted) = self.permitted_host_devices() else {
            return Ok(());
        };
        let allowed = |name: &str| {
            permitted.pci_host_devices.iter().any(|d| d.resource_name == name)
                || permitted.mediated_devices.iter().any(|d| d.resource_name == name)
        };

        let mut violations = Vec::new();
        for gpu in devices.gpus.iter().filter(|d| !allowed(&d.device_name)) {
            violations.push(format!(
                "GPU {} is not permitted in permittedHostDevices configuration",
                gpu.device_name
            ));
        }
        for dev in devices.host_devices.iter().filter(|d| !allowed(&d.device_name)) {
            violations.push(format!(
                "HostDevice {} is not permitted in permittedHostDevices configuration",
                dev.device_name
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_for_field(
                vmi,
                "spec.domain.devices",
                violations.join(" "),
            ))
        }
    }

    /// Log verbosity for `component`, honoring per-node overrides
    ///
    /// A non-zero entry for `node_name` wins for node-bound components.
    /// Unconfigured components get [`DEFAULT_LOG_VERBOSITY`].
    pub fn verbosity(&self, component: VirtComponent, node_name: Option<&str>) -> u32 {
        let current = self.current.read();
        let Some(conf) = current
            .developer_configuration
            .as_ref()
            .and_then(|d| d.log_verbosity.as_ref())
        else {
            return DEFAULT_LOG_VERBOSITY;
        };

        if component.is_node_bound() {
            let node_level = node_name.and_then(|node| {
                conf.node_verbosity
                    .as_ref()
                    .and_then(|nv| nv.get(node).copied())
            });
            if let Some(level) = node_level.filter(|l| *l != 0) {
                return level;
            }
        }

        component.configured(conf).unwrap_or(DEFAULT_LOG_VERBOSITY)
    }

    /// Verbosity lookup by component name
    ///
    /// Unknown names are logged and resolve to the default.
    pub fn verbosity_by_name(&self, component: &str, node_name: Option<&str>) -> u32 {
        match component.parse::<VirtComponent>() {
            Ok(c) => self.verbosity(c, node_name),
            Err(e) => {
                warn!(error = %e, "verbosity requested for unknown component");
                DEFAULT_LOG_VERBOSITY
            }
        }
    }
}
