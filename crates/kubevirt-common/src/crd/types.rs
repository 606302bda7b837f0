//! Supporting types shared by the migration-related CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., AbortRequested)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// How a VMI reacts to node drains and evictions
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Evictions are not intercepted
    None,
    /// Evictions trigger a live migration and are blocked until it completes
    LiveMigrate,
    /// Live migrate if the VMI is migratable, otherwise shut it down
    LiveMigrateIfPossible,
    /// An external component handles the eviction
    External,
}

/// Live migration tuning, cluster-wide or as snapshotted into VMI status
///
/// Field order is the wire order and matters for test-and-set patches that
/// compare a previously written snapshot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfiguration {
    /// Maximum in-flight migrations across the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_migrations_per_cluster: Option<u32>,

    /// Maximum in-flight outbound migrations per source node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_outbound_migrations_per_node: Option<u32>,

    /// Bandwidth cap per migration ("0Mi" means unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_per_migration: Option<Quantity>,

    /// Seconds of allowed transfer time per GiB of guest memory
    #[serde(
        default,
        rename = "completionTimeoutPerGiB",
        skip_serializing_if = "Option::is_none"
    )]
    pub completion_timeout_per_gib: Option<i64>,

    /// Seconds without progress before a migration is aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout: Option<i64>,

    /// Allow migrating VMIs with unsafe disk caching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsafe_migration_override: Option<bool>,

    /// Allow the hypervisor to throttle the guest to converge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_auto_converge: Option<bool>,

    /// Allow switching to post-copy when pre-copy cannot converge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_post_copy: Option<bool>,

    /// Disable TLS on the migration channel
    #[serde(default, rename = "disableTLS", skip_serializing_if = "Option::is_none")]
    pub disable_tls: Option<bool>,

    /// Dedicated migration network name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Taint key that marks a node as draining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_drain_taint_key: Option<String>,
}

impl MigrationConfiguration {
    /// Fill every unset field from `defaults`
    pub fn merged_over(mut self, defaults: &MigrationConfiguration) -> Self {
        fn fill<T: Clone>(field: &mut Option<T>, default: &Option<T>) {
            if field.is_none() {
                field.clone_from(default);
            }
        }
        fill(
            &mut self.parallel_migrations_per_cluster,
            &defaults.parallel_migrations_per_cluster,
        );
        fill(
            &mut self.parallel_outbound_migrations_per_node,
            &defaults.parallel_outbound_migrations_per_node,
        );
        fill(
            &mut self.bandwidth_per_migration,
            &defaults.bandwidth_per_migration,
        );
        fill(
            &mut self.completion_timeout_per_gib,
            &defaults.completion_timeout_per_gib,
        );
        fill(&mut self.progress_timeout, &defaults.progress_timeout);
        fill(
            &mut self.unsafe_migration_override,
            &defaults.unsafe_migration_override,
        );
        fill(&mut self.allow_auto_converge, &defaults.allow_auto_converge);
        fill(&mut self.allow_post_copy, &defaults.allow_post_copy);
        fill(&mut self.disable_tls, &defaults.disable_tls);
        fill(&mut self.network, &defaults.network);
        fill(&mut self.node_drain_taint_key, &defaults.node_drain_taint_key);
        self
    }
}

/// Skip helper for `bool` fields that are omitted when false
pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
