//! KubeVirt Custom Resource, reduced to the configuration the migration
//! controller consumes

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{EvictionStrategy, MigrationConfiguration};

/// A PCI device the cluster allows VMIs to request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PciHostDevice {
    /// vendor:device selector
    #[serde(default)]
    pub pci_vendor_selector: String,
    /// Resource name advertised by the device plugin
    pub resource_name: String,
    /// Advertised by an external device plugin
    #[serde(default)]
    pub external_resource_provider: bool,
}

/// A mediated device type the cluster allows VMIs to request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediatedHostDevice {
    /// mdev type name selector
    #[serde(default)]
    pub mdev_name_selector: String,
    /// Resource name advertised by the device plugin
    pub resource_name: String,
    /// Advertised by an external device plugin
    #[serde(default)]
    pub external_resource_provider: bool,
}

/// Allow-list of host devices
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermittedHostDevices {
    /// PCI passthrough devices
    #[serde(default)]
    pub pci_host_devices: Vec<PciHostDevice>,
    /// Mediated devices
    #[serde(default)]
    pub mediated_devices: Vec<MediatedHostDevice>,
}

/// Per-component log verbosity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LogVerbosity {
    /// virt-api
    #[serde(default, rename = "virtAPI", skip_serializing_if = "Option::is_none")]
    pub virt_api: Option<u32>,
    /// virt-controller
    #[serde(default, rename = "virtController", skip_serializing_if = "Option::is_none")]
    pub virt_controller: Option<u32>,
    /// virt-handler
    #[serde(default, rename = "virtHandler", skip_serializing_if = "Option::is_none")]
    pub virt_handler: Option<u32>,
    /// virt-launcher
    #[serde(default, rename = "virtLauncher", skip_serializing_if = "Option::is_none")]
    pub virt_launcher: Option<u32>,
    /// virt-operator
    #[serde(default, rename = "virtOperator", skip_serializing_if = "Option::is_none")]
    pub virt_operator: Option<u32>,
    /// Node name to verbosity, overriding node-bound components
    #[serde(default, rename = "nodeVerbosity", skip_serializing_if = "Option::is_none")]
    pub node_verbosity: Option<BTreeMap<String, u32>>,
}

/// Developer knobs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeveloperConfiguration {
    /// Log verbosity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_verbosity: Option<LogVerbosity>,
}

/// Cluster-wide KubeVirt configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtConfiguration {
    /// Migration defaults
    #[serde(default, rename = "migrations", skip_serializing_if = "Option::is_none")]
    pub migration_configuration: Option<MigrationConfiguration>,

    /// Default eviction strategy for VMIs that set none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_strategy: Option<EvictionStrategy>,

    /// Host device allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permitted_host_devices: Option<PermittedHostDevices>,

    /// Developer configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_configuration: Option<DeveloperConfiguration>,
}

/// Specification for the KubeVirt install object
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "KubeVirt",
    plural = "kubevirts",
    shortname = "kv",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtSpec {
    /// Cluster configuration
    #[serde(default)]
    pub configuration: KubeVirtConfiguration,
}
