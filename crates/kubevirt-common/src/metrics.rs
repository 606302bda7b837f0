//! Metrics registry for the migration controller
//!
//! OpenTelemetry instruments covering reconciliation, phase transitions,
//! admission deferrals, target pod churn and garbage collection.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("kubevirt-migration"));

// ============================================================================
// Reconciliation
// ============================================================================

/// Histogram of migration reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kubevirt_migration_reconcile_duration_seconds")
        .with_description("Duration of migration reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_reconcile_errors_total")
        .with_description("Total number of migration reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of migration phase transitions
///
/// Labels:
/// - `phase`: phase entered
pub static PHASE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_phase_transitions_total")
        .with_description("Total number of migration phase transitions")
        .with_unit("{transitions}")
        .build()
});

// ============================================================================
// Admission and pods
// ============================================================================

/// Counter of Pending passes deferred by a concurrency limit
///
/// Labels:
/// - `limit`: cluster, node
pub static ADMISSION_DEFERRED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_admission_deferred_total")
        .with_description("Pending migrations deferred by parallel migration limits")
        .with_unit("{migrations}")
        .build()
});

/// Counter of pods created for migrations
///
/// Labels:
/// - `role`: target, attachment
pub static PODS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_pods_created_total")
        .with_description("Total number of migration pods created")
        .with_unit("{pods}")
        .build()
});

/// Counter of target pods deleted by the timeout handlers
///
/// Labels:
/// - `reason`: unschedulable, pending
pub static PODS_TIMED_OUT: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_pods_timed_out_total")
        .with_description("Total number of target pods deleted after a timeout")
        .with_unit("{pods}")
        .build()
});

/// Counter of finalized migrations removed by garbage collection
pub static GARBAGE_COLLECTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubevirt_migration_garbage_collected_total")
        .with_description("Total number of finalized migrations garbage collected")
        .with_unit("{migrations}")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Which concurrency limit deferred a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionLimit {
    /// ParallelMigrationsPerCluster
    Cluster,
    /// ParallelOutboundMigrationsPerNode
    Node,
}

impl AdmissionLimit {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Node => "node",
        }
    }
}

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record error completion
    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        let error_type = if retryable { "transient" } else { "permanent" };
        RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}

/// Record a phase transition
pub fn record_phase_transition(phase: &str) {
    PHASE_TRANSITIONS.add(1, &[KeyValue::new("phase", phase.to_string())]);
}

/// Record an admission deferral
pub fn record_admission_deferred(limit: AdmissionLimit) {
    ADMISSION_DEFERRED.add(1, &[KeyValue::new("limit", limit.as_str())]);
}
